use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::migration::{Migration, MigrationId, Strategy};

/// One applied migration as remembered by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub migration_id: MigrationId,
    pub name: String,
    pub strategy: Strategy,
    /// Checksum of the migration at the time it was applied.
    pub checksum: String,
    pub batch: u32,
    pub applied_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(migration: &Migration, batch: u32) -> Self {
        Self {
            migration_id: migration.id(),
            name: migration.name().to_string(),
            strategy: migration.strategy(),
            checksum: migration.checksum().to_string(),
            batch,
            applied_at: Utc::now(),
        }
    }
}

/// Record of which migrations are applied. Entries are only ever added by
/// forward application and removed by rollback.
pub trait VersionLedger {
    /// All entries, ordered by migration id.
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Fails with [`StoreError::DuplicateEntry`] when the id is already recorded.
    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Fails with [`StoreError::MissingEntry`] when the id is not recorded.
    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError>;

    fn applied(&mut self) -> Result<BTreeSet<MigrationId>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|entry| entry.migration_id)
            .collect())
    }

    fn next_batch(&mut self) -> Result<u32, StoreError> {
        Ok(self
            .entries()?
            .iter()
            .map(|entry| entry.batch)
            .max()
            .unwrap_or(0)
            + 1)
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    entries: BTreeMap<MigrationId, LedgerEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.migration_id, entry))
                .collect(),
        }
    }
}

impl VersionLedger for InMemoryLedger {
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        if self.entries.contains_key(&entry.migration_id) {
            return Err(StoreError::DuplicateEntry(entry.migration_id));
        }
        self.entries.insert(entry.migration_id, entry.clone());
        Ok(())
    }

    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError> {
        self.entries
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::MissingEntry(id))
    }
}

impl<L: VersionLedger + ?Sized> VersionLedger for &mut L {
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).entries()
    }

    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        (**self).record(entry)
    }

    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError> {
        (**self).erase(id)
    }
}
