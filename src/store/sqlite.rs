use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::backend::{Backend, Sqlite};
use crate::config::MigratorConfig;
use crate::error::{MigrationError, StoreError};
use crate::ledger::{LedgerEntry, VersionLedger};
use crate::migration::MigrationId;
use crate::schema::SchemaSnapshot;
use crate::snapshot::SnapshotStore;
use crate::store::{ledger_entry, sql_id, StoreConnection};

/// Ledger, snapshot and lock tables kept in the SQLite database being
/// migrated, so all of them commit together with the schema change.
pub struct SqliteStore<'a> {
    conn: &'a Connection,
    ledger_table: String,
    snapshot_table: String,
    lock_table: String,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Result<Self, MigrationError> {
        Self::with_config(conn, &MigratorConfig::default())
    }

    pub fn with_config(
        conn: &'a Connection,
        config: &MigratorConfig,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        conn.busy_timeout(config.busy_timeout)
            .map_err(StoreError::from)?;

        let store = Self {
            conn,
            ledger_table: config.ledger_table.clone(),
            snapshot_table: config.snapshot_table.clone(),
            lock_table: format!("{}_lock", config.ledger_table),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {ledger} (
                migration_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                strategy TEXT NOT NULL,
                checksum TEXT NOT NULL,
                batch INTEGER NOT NULL,
                applied_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {snapshot} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {lock} (
                name TEXT PRIMARY KEY,
                acquired_at TEXT NOT NULL
            );",
            ledger = self.ledger_table,
            snapshot = self.snapshot_table,
            lock = self.lock_table,
        ))?;
        Ok(())
    }
}

impl StoreConnection for SqliteStore<'_> {
    fn backend(&self) -> &dyn Backend {
        &Sqlite
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn try_lock(&mut self, name: &str) -> Result<bool, StoreError> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (name, acquired_at) VALUES (?1, ?2)",
                self.lock_table
            ),
            params![name, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    fn unlock(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE name = ?1", self.lock_table),
            params![name],
        )?;
        Ok(())
    }
}

impl VersionLedger for SqliteStore<'_> {
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT migration_id, name, strategy, checksum, batch, applied_at
             FROM {} ORDER BY migration_id",
            self.ledger_table
        ))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, strategy, checksum, batch, applied_at)| {
                ledger_entry(id, name, &strategy, checksum, batch, &applied_at)
            })
            .collect()
    }

    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let result = self.conn.execute(
            &format!(
                "INSERT INTO {} (migration_id, name, strategy, checksum, batch, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                self.ledger_table
            ),
            params![
                sql_id(entry.migration_id)?,
                entry.name,
                entry.strategy.as_str(),
                entry.checksum,
                i64::from(entry.batch),
                entry.applied_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateEntry(entry.migration_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError> {
        let deleted = self.conn.execute(
            &format!("DELETE FROM {} WHERE migration_id = ?1", self.ledger_table),
            params![sql_id(id)?],
        )?;
        if deleted == 0 {
            return Err(StoreError::MissingEntry(id));
        }
        Ok(())
    }
}

impl SnapshotStore for SqliteStore<'_> {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = 1", self.snapshot_table),
                [],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(SchemaSnapshot::new()),
        }
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, body) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                self.snapshot_table
            ),
            params![body],
        )?;
        Ok(())
    }
}
