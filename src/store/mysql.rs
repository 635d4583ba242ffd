use mysql::prelude::*;
use mysql::PooledConn;

use crate::backend::{Backend, MySql};
use crate::config::MigratorConfig;
use crate::error::{MigrationError, StoreError};
use crate::ledger::{LedgerEntry, VersionLedger};
use crate::migration::MigrationId;
use crate::schema::SchemaSnapshot;
use crate::snapshot::SnapshotStore;
use crate::store::{ledger_entry, sql_id, StoreConnection};

const ER_DUP_ENTRY: u16 = 1062;

/// Ledger and snapshot tables in the MySQL database being migrated. The
/// migration lock is a named `GET_LOCK` lock held by this connection.
///
/// MySQL commits implicitly around DDL, so a failed migration can leave
/// ledger or snapshot rows behind; the executor undoes those itself.
pub struct MySqlStore<'a> {
    conn: &'a mut PooledConn,
    ledger_table: String,
    snapshot_table: String,
}

impl<'a> MySqlStore<'a> {
    pub fn new(conn: &'a mut PooledConn) -> Result<Self, MigrationError> {
        Self::with_config(conn, &MigratorConfig::default())
    }

    pub fn with_config(
        conn: &'a mut PooledConn,
        config: &MigratorConfig,
    ) -> Result<Self, MigrationError> {
        config.validate()?;

        let mut store = Self {
            conn,
            ledger_table: config.ledger_table.clone(),
            snapshot_table: config.snapshot_table.clone(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&mut self) -> Result<(), StoreError> {
        self.conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                migration_id BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                strategy VARCHAR(32) NOT NULL,
                checksum VARCHAR(64) NOT NULL,
                batch BIGINT NOT NULL,
                applied_at VARCHAR(64) NOT NULL
            )",
            self.ledger_table
        ))?;
        self.conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INT PRIMARY KEY,
                body LONGTEXT NOT NULL
            )",
            self.snapshot_table
        ))?;
        Ok(())
    }
}

impl StoreConnection for MySqlStore<'_> {
    fn backend(&self) -> &dyn Backend {
        &MySql
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn.query_drop("START TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn.query_drop("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.conn.query_drop("ROLLBACK")?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.conn.query_drop(sql)?;
        Ok(())
    }

    fn try_lock(&mut self, name: &str) -> Result<bool, StoreError> {
        // NULL means the server failed to take the lock at all
        let acquired: Option<Option<i64>> =
            self.conn.exec_first("SELECT GET_LOCK(?, 0)", (name,))?;
        match acquired.flatten() {
            Some(result) => Ok(result == 1),
            None => Err(StoreError::Rejected(format!(
                "GET_LOCK({:?}) returned NULL",
                name
            ))),
        }
    }

    fn unlock(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn.exec_drop("DO RELEASE_LOCK(?)", (name,))?;
        Ok(())
    }
}

impl VersionLedger for MySqlStore<'_> {
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows: Vec<(i64, String, String, String, i64, String)> = self.conn.query(format!(
            "SELECT migration_id, name, strategy, checksum, batch, applied_at
             FROM {} ORDER BY migration_id",
            self.ledger_table
        ))?;

        rows.into_iter()
            .map(|(id, name, strategy, checksum, batch, applied_at)| {
                ledger_entry(id, name, &strategy, checksum, batch, &applied_at)
            })
            .collect()
    }

    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let result = self.conn.exec_drop(
            format!(
                "INSERT INTO {} (migration_id, name, strategy, checksum, batch, applied_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                self.ledger_table
            ),
            (
                sql_id(entry.migration_id)?,
                entry.name.as_str(),
                entry.strategy.as_str(),
                entry.checksum.as_str(),
                i64::from(entry.batch),
                entry.applied_at.to_rfc3339(),
            ),
        );

        match result {
            Ok(()) => Ok(()),
            Err(mysql::Error::MySqlError(ref e)) if e.code == ER_DUP_ENTRY => {
                Err(StoreError::DuplicateEntry(entry.migration_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError> {
        self.conn.exec_drop(
            format!("DELETE FROM {} WHERE migration_id = ?", self.ledger_table),
            (sql_id(id)?,),
        )?;
        if self.conn.affected_rows() == 0 {
            return Err(StoreError::MissingEntry(id));
        }
        Ok(())
    }
}

impl SnapshotStore for MySqlStore<'_> {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        let body: Option<String> = self.conn.query_first(format!(
            "SELECT body FROM {} WHERE id = 1",
            self.snapshot_table
        ))?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(SchemaSnapshot::new()),
        }
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        self.conn.exec_drop(
            format!(
                "INSERT INTO {} (id, body) VALUES (1, ?)
                 ON DUPLICATE KEY UPDATE body = VALUES(body)",
                self.snapshot_table
            ),
            (body,),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Strategy;
    use mysql::{Pool, PooledConn};
    use std::env;

    fn get_test_conn() -> Option<PooledConn> {
        let host = env::var("MYSQL_HOST").unwrap_or_else(|_| "localhost".to_string());
        let user = env::var("MYSQL_USER").unwrap_or_else(|_| "root".to_string());
        let password = env::var("MYSQL_PASSWORD").ok();
        let dbname = env::var("MYSQL_DB").unwrap_or_else(|_| "schemaflow_test".to_string());

        let url = if let Some(pw) = password {
            format!("mysql://{}:{}@{}/{}", user, pw, host, dbname)
        } else {
            format!("mysql://{}@{}/{}", user, host, dbname)
        };

        Pool::new(url.as_str()).ok()?.get_conn().ok()
    }

    fn config(prefix: &str) -> MigratorConfig {
        MigratorConfig::new()
            .with_ledger_table(format!("{}_migrations", prefix))
            .with_snapshot_table(format!("{}_snapshot", prefix))
    }

    fn cleanup(conn: &mut PooledConn, prefix: &str) {
        let _ = conn.query_drop(format!("DROP TABLE IF EXISTS {}_migrations", prefix));
        let _ = conn.query_drop(format!("DROP TABLE IF EXISTS {}_snapshot", prefix));
    }

    fn entry(id: u64) -> LedgerEntry {
        LedgerEntry {
            migration_id: MigrationId::new(id),
            name: format!("m{}", id),
            strategy: Strategy::RawScript,
            checksum: "abc".to_string(),
            batch: 1,
            applied_at: chrono::Utc::now(),
        }
    }

    #[test]
    #[ignore = "requires mysql connection"]
    fn record_and_erase() {
        let Some(mut conn) = get_test_conn() else {
            return;
        };
        let prefix = "test_my_record";
        cleanup(&mut conn, prefix);

        {
            let mut store = MySqlStore::with_config(&mut conn, &config(prefix)).unwrap();
            store.record(&entry(1)).unwrap();
            assert!(matches!(
                store.record(&entry(1)),
                Err(StoreError::DuplicateEntry(_))
            ));

            store.erase(MigrationId::new(1)).unwrap();
            assert!(matches!(
                store.erase(MigrationId::new(1)),
                Err(StoreError::MissingEntry(_))
            ));
        }

        cleanup(&mut conn, prefix);
    }

    #[test]
    #[ignore = "requires mysql connection"]
    fn snapshot_upsert() {
        let Some(mut conn) = get_test_conn() else {
            return;
        };
        let prefix = "test_my_snapshot";
        cleanup(&mut conn, prefix);

        {
            let mut store = MySqlStore::with_config(&mut conn, &config(prefix)).unwrap();
            assert!(store.load().unwrap().is_empty());
            store.save(&SchemaSnapshot::new()).unwrap();
            store.save(&SchemaSnapshot::new()).unwrap();
            assert!(store.load().unwrap().is_empty());
        }

        cleanup(&mut conn, prefix);
    }

    #[test]
    #[ignore = "requires mysql connection"]
    fn named_lock_is_exclusive() {
        let (Some(mut first), Some(mut second)) = (get_test_conn(), get_test_conn()) else {
            return;
        };
        let prefix = "test_my_lock";
        cleanup(&mut first, prefix);

        {
            let mut a = MySqlStore::with_config(&mut first, &config(prefix)).unwrap();
            let mut b = MySqlStore::with_config(&mut second, &config(prefix)).unwrap();

            assert!(!a.rolls_back_bookkeeping());
            assert!(a.try_lock("test_my_lock").unwrap());
            assert!(!b.try_lock("test_my_lock").unwrap());
            a.unlock("test_my_lock").unwrap();
            assert!(b.try_lock("test_my_lock").unwrap());
            b.unlock("test_my_lock").unwrap();
        }

        cleanup(&mut first, prefix);
    }
}
