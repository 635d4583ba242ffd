use postgres::error::SqlState;
use postgres::Client;
use sha2::{Digest, Sha256};

use crate::backend::{Backend, Postgres};
use crate::config::MigratorConfig;
use crate::error::{MigrationError, StoreError};
use crate::ledger::{LedgerEntry, VersionLedger};
use crate::migration::MigrationId;
use crate::schema::SchemaSnapshot;
use crate::snapshot::SnapshotStore;
use crate::store::{ledger_entry, sql_id, StoreConnection};

/// Ledger and snapshot tables in the PostgreSQL database being migrated.
/// The migration lock is a session-level advisory lock.
pub struct PostgresStore<'a> {
    client: &'a mut Client,
    ledger_table: String,
    snapshot_table: String,
}

impl<'a> PostgresStore<'a> {
    pub fn new(client: &'a mut Client) -> Result<Self, MigrationError> {
        Self::with_config(client, &MigratorConfig::default())
    }

    pub fn with_config(
        client: &'a mut Client,
        config: &MigratorConfig,
    ) -> Result<Self, MigrationError> {
        config.validate()?;

        let mut store = Self {
            client,
            ledger_table: config.ledger_table.clone(),
            snapshot_table: config.snapshot_table.clone(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {ledger} (
                migration_id BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                strategy TEXT NOT NULL,
                checksum TEXT NOT NULL,
                batch BIGINT NOT NULL,
                applied_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {snapshot} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL
            );",
            ledger = self.ledger_table,
            snapshot = self.snapshot_table,
        ))?;
        Ok(())
    }
}

/// Advisory locks are keyed by a 64-bit integer.
fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(key)
}

impl StoreConnection for PostgresStore<'_> {
    fn backend(&self) -> &dyn Backend {
        &Postgres
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.client.batch_execute("ROLLBACK")?;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn try_lock(&mut self, name: &str) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&advisory_key(name)])?;
        Ok(row.try_get(0)?)
    }

    fn unlock(&mut self, name: &str) -> Result<(), StoreError> {
        self.client
            .execute("SELECT pg_advisory_unlock($1)", &[&advisory_key(name)])?;
        Ok(())
    }
}

impl VersionLedger for PostgresStore<'_> {
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = self.client.query(
            &format!(
                "SELECT migration_id, name, strategy, checksum, batch, applied_at
                 FROM {} ORDER BY migration_id",
                self.ledger_table
            ),
            &[],
        )?;

        rows.iter()
            .map(|row| {
                let strategy: String = row.try_get(2)?;
                let applied_at: String = row.try_get(5)?;
                ledger_entry(
                    row.try_get(0)?,
                    row.try_get(1)?,
                    &strategy,
                    row.try_get(3)?,
                    row.try_get(4)?,
                    &applied_at,
                )
            })
            .collect()
    }

    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let id = sql_id(entry.migration_id)?;
        let batch = i64::from(entry.batch);
        let applied_at = entry.applied_at.to_rfc3339();

        let result = self.client.execute(
            &format!(
                "INSERT INTO {} (migration_id, name, strategy, checksum, batch, applied_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                self.ledger_table
            ),
            &[
                &id,
                &entry.name,
                &entry.strategy.as_str(),
                &entry.checksum,
                &batch,
                &applied_at,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(StoreError::DuplicateEntry(entry.migration_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError> {
        let deleted = self.client.execute(
            &format!("DELETE FROM {} WHERE migration_id = $1", self.ledger_table),
            &[&sql_id(id)?],
        )?;
        if deleted == 0 {
            return Err(StoreError::MissingEntry(id));
        }
        Ok(())
    }
}

impl SnapshotStore for PostgresStore<'_> {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        let row = self.client.query_opt(
            &format!("SELECT body FROM {} WHERE id = 1", self.snapshot_table),
            &[],
        )?;

        match row {
            Some(row) => {
                let body: String = row.try_get(0)?;
                Ok(serde_json::from_str(&body)?)
            }
            None => Ok(SchemaSnapshot::new()),
        }
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        self.client.execute(
            &format!(
                "INSERT INTO {} (id, body) VALUES (1, $1)
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body",
                self.snapshot_table
            ),
            &[&body],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Strategy;
    use postgres::{Client, NoTls};
    use std::env;

    fn get_test_client() -> Option<Client> {
        let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
        let user = env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
        let password = env::var("POSTGRES_PASSWORD").ok();
        let dbname = env::var("POSTGRES_DB").unwrap_or_else(|_| "schemaflow_test".to_string());

        let mut config = format!("host={} user={} dbname={}", host, user, dbname);
        if let Some(pw) = password {
            config.push_str(&format!(" password={}", pw));
        }

        Client::connect(&config, NoTls).ok()
    }

    fn config(prefix: &str) -> MigratorConfig {
        MigratorConfig::new()
            .with_ledger_table(format!("{}_migrations", prefix))
            .with_snapshot_table(format!("{}_snapshot", prefix))
    }

    fn cleanup(client: &mut Client, prefix: &str) {
        let _ = client.batch_execute(&format!(
            "DROP TABLE IF EXISTS {0}_migrations; DROP TABLE IF EXISTS {0}_snapshot;",
            prefix
        ));
    }

    fn entry(id: u64) -> LedgerEntry {
        LedgerEntry {
            migration_id: MigrationId::new(id),
            name: format!("m{}", id),
            strategy: Strategy::ModelDiff,
            checksum: "abc".to_string(),
            batch: 1,
            applied_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn advisory_key_is_stable() {
        assert_eq!(advisory_key("schemaflow"), advisory_key("schemaflow"));
        assert_ne!(advisory_key("schemaflow"), advisory_key("other"));
    }

    #[test]
    #[ignore = "requires postgres connection"]
    fn record_and_erase() {
        let Some(mut client) = get_test_client() else {
            return;
        };
        let prefix = "test_pg_record";
        cleanup(&mut client, prefix);

        {
            let mut store = PostgresStore::with_config(&mut client, &config(prefix)).unwrap();
            store.record(&entry(1)).unwrap();
            store.record(&entry(2)).unwrap();
            assert!(matches!(
                store.record(&entry(1)),
                Err(StoreError::DuplicateEntry(_))
            ));

            store.erase(MigrationId::new(2)).unwrap();
            let entries = store.entries().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].strategy, Strategy::ModelDiff);
        }

        cleanup(&mut client, prefix);
    }

    #[test]
    #[ignore = "requires postgres connection"]
    fn rollback_undoes_bookkeeping() {
        let Some(mut client) = get_test_client() else {
            return;
        };
        let prefix = "test_pg_rollback";
        cleanup(&mut client, prefix);

        {
            let mut store = PostgresStore::with_config(&mut client, &config(prefix)).unwrap();
            store.begin().unwrap();
            store.record(&entry(1)).unwrap();
            store.save(&SchemaSnapshot::new()).unwrap();
            store.rollback().unwrap();

            assert!(store.entries().unwrap().is_empty());
        }

        cleanup(&mut client, prefix);
    }

    #[test]
    #[ignore = "requires postgres connection"]
    fn advisory_lock_is_exclusive() {
        let (Some(mut first), Some(mut second)) = (get_test_client(), get_test_client()) else {
            return;
        };
        let prefix = "test_pg_lock";
        cleanup(&mut first, prefix);

        {
            let mut a = PostgresStore::with_config(&mut first, &config(prefix)).unwrap();
            let mut b = PostgresStore::with_config(&mut second, &config(prefix)).unwrap();

            assert!(a.try_lock("test_pg_lock").unwrap());
            assert!(!b.try_lock("test_pg_lock").unwrap());
            a.unlock("test_pg_lock").unwrap();
            assert!(b.try_lock("test_pg_lock").unwrap());
            b.unlock("test_pg_lock").unwrap();
        }

        cleanup(&mut first, prefix);
    }
}
