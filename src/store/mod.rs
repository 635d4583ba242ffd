mod memory;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;

#[cfg(feature = "mysql")]
pub use self::mysql::MySqlStore;

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresStore;

#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteStore;

use crate::backend::Backend;
use crate::error::StoreError;
use crate::ledger::VersionLedger;
use crate::snapshot::SnapshotStore;

#[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
use crate::{ledger::LedgerEntry, migration::MigrationId};

/// Transactional access to the target store plus its advisory lock.
pub trait StoreConnection {
    fn backend(&self) -> &dyn Backend;

    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;

    fn execute(&mut self, sql: &str) -> Result<(), StoreError>;

    /// Takes the named lock without blocking. `false` when someone else holds it.
    fn try_lock(&mut self, name: &str) -> Result<bool, StoreError>;
    fn unlock(&mut self, name: &str) -> Result<(), StoreError>;

    /// Whether ledger and snapshot writes made inside a transaction are
    /// undone by [`rollback`](Self::rollback).
    fn rolls_back_bookkeeping(&self) -> bool {
        self.backend().supports_transactional_ddl()
    }
}

impl<C: StoreConnection + ?Sized> StoreConnection for &mut C {
    fn backend(&self) -> &dyn Backend {
        (**self).backend()
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        (**self).rollback()
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        (**self).execute(sql)
    }

    fn try_lock(&mut self, name: &str) -> Result<bool, StoreError> {
        (**self).try_lock(name)
    }

    fn unlock(&mut self, name: &str) -> Result<(), StoreError> {
        (**self).unlock(name)
    }

    fn rolls_back_bookkeeping(&self) -> bool {
        (**self).rolls_back_bookkeeping()
    }
}

/// Everything the executor needs from one store.
pub trait Store: StoreConnection + VersionLedger + SnapshotStore {}

impl<T: StoreConnection + VersionLedger + SnapshotStore> Store for T {}

#[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
pub(crate) fn ledger_entry(
    migration_id: i64,
    name: String,
    strategy: &str,
    checksum: String,
    batch: i64,
    applied_at: &str,
) -> Result<LedgerEntry, StoreError> {
    let migration_id = u64::try_from(migration_id)
        .map(MigrationId::new)
        .map_err(|_| StoreError::Corrupt(format!("negative migration id {}", migration_id)))?;
    let strategy = strategy.parse().map_err(StoreError::Corrupt)?;
    let batch = u32::try_from(batch)
        .map_err(|_| StoreError::Corrupt(format!("batch {} out of range", batch)))?;
    let applied_at = chrono::DateTime::parse_from_rfc3339(applied_at)
        .map_err(|e| StoreError::Corrupt(format!("applied_at {:?}: {}", applied_at, e)))?
        .with_timezone(&chrono::Utc);

    Ok(LedgerEntry {
        migration_id,
        name,
        strategy,
        checksum,
        batch,
        applied_at,
    })
}

#[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
pub(crate) fn sql_id(id: MigrationId) -> Result<i64, StoreError> {
    i64::try_from(id.get())
        .map_err(|_| StoreError::Corrupt(format!("migration id {} too large", id)))
}
