use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, Sqlite};
use crate::error::StoreError;
use crate::ledger::{InMemoryLedger, LedgerEntry, VersionLedger};
use crate::migration::MigrationId;
use crate::schema::SchemaSnapshot;
use crate::snapshot::{InMemorySnapshotStore, SnapshotStore};
use crate::store::StoreConnection;

/// A store that keeps everything in memory and records the SQL it is
/// asked to run. Statements only count as executed once committed.
///
/// Ledger and snapshot writes are not transactional here, which is
/// what the executor's compensation path is exercised against.
pub struct MemoryStore {
    backend: Box<dyn Backend>,
    ledger: InMemoryLedger,
    snapshot: InMemorySnapshotStore,
    executed: Vec<String>,
    pending: Option<Vec<String>>,
    locks: Arc<Mutex<BTreeSet<String>>>,
    fail_patterns: Vec<String>,
    fail_snapshot_saves: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_backend(Sqlite)
    }

    pub fn with_backend(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            ledger: InMemoryLedger::new(),
            snapshot: InMemorySnapshotStore::new(),
            executed: Vec::new(),
            pending: None,
            locks: Arc::new(Mutex::new(BTreeSet::new())),
            fail_patterns: Vec::new(),
            fail_snapshot_saves: false,
        }
    }

    /// A fresh store whose locks are shared with `other`, standing in for a
    /// second process pointed at the same database.
    pub fn sharing_locks_with(other: &MemoryStore) -> Self {
        let mut store = Self::new();
        store.locks = Arc::clone(&other.locks);
        store
    }

    pub fn with_ledger(mut self, ledger: InMemoryLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SchemaSnapshot) -> Self {
        self.snapshot = InMemorySnapshotStore::with_snapshot(snapshot);
        self
    }

    /// Makes every statement containing `pattern` fail.
    pub fn fail_on(mut self, pattern: impl Into<String>) -> Self {
        self.fail_patterns.push(pattern.into());
        self
    }

    pub fn fail_snapshot_saves(mut self) -> Self {
        self.fail_snapshot_saves = true;
        self
    }

    /// Committed statements in execution order.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .map(|locks| locks.contains(name))
            .unwrap_or(false)
    }

    fn locks(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<String>>, StoreError> {
        self.locks
            .lock()
            .map_err(|_| StoreError::Rejected("lock table poisoned".to_string()))
    }
}

impl StoreConnection for MemoryStore {
    fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        if self.pending.is_some() {
            return Err(StoreError::Rejected(
                "a transaction is already open".to_string(),
            ));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| StoreError::Rejected("no open transaction".to_string()))?;
        self.executed.extend(pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending = None;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        if let Some(pattern) = self.fail_patterns.iter().find(|p| sql.contains(p.as_str())) {
            return Err(StoreError::Rejected(format!(
                "statement matched failure pattern {:?}",
                pattern
            )));
        }
        match self.pending {
            Some(ref mut pending) => pending.push(sql.to_string()),
            None => self.executed.push(sql.to_string()),
        }
        Ok(())
    }

    fn try_lock(&mut self, name: &str) -> Result<bool, StoreError> {
        Ok(self.locks()?.insert(name.to_string()))
    }

    fn unlock(&mut self, name: &str) -> Result<(), StoreError> {
        self.locks()?.remove(name);
        Ok(())
    }

    fn rolls_back_bookkeeping(&self) -> bool {
        false
    }
}

impl VersionLedger for MemoryStore {
    fn entries(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.ledger.entries()
    }

    fn record(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.ledger.record(entry)
    }

    fn erase(&mut self, id: MigrationId) -> Result<(), StoreError> {
        self.ledger.erase(id)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        self.snapshot.load()
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        if self.fail_snapshot_saves {
            return Err(StoreError::Rejected("snapshot store unavailable".to_string()));
        }
        self.snapshot.save(snapshot)
    }
}
