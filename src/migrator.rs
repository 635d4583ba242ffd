use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};

use crate::config::{LockMode, MigratorConfig};
use crate::error::{MigrationError, Result, StoreError};
use crate::ledger::LedgerEntry;
use crate::migration::{Migration, MigrationId, MigrationRegistry, Strategy};
use crate::operation::Operation;
use crate::planner;
use crate::schema::SchemaSnapshot;
use crate::selector::{self, GenerationRequest};
use crate::source::{GenerationContext, MigrationSource};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpTarget {
    Latest,
    /// Apply up to and including this migration.
    To(MigrationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTarget {
    /// Revert everything applied after this migration, keeping it applied.
    To(MigrationId),
    /// Revert the last `n` migrations in reverse application order.
    Steps(usize),
    /// Revert every migration of the highest batch.
    LastBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Applying,
    Applied,
    Reverting,
    Reverted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub id: MigrationId,
    pub name: String,
    pub state: MigrationState,
    pub duration: Duration,
}

/// What one `up` or `down` run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Batch number given to applied migrations. `None` for rollbacks and
    /// runs with nothing to do.
    pub batch: Option<u32>,
    pub outcomes: Vec<MigrationOutcome>,
    /// Set when the run stopped early on a cancellation request.
    pub cancelled: bool,
}

impl BatchReport {
    pub fn completed(&self) -> Vec<MigrationId> {
        self.outcomes.iter().map(|outcome| outcome.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Cooperative stop signal, checked between migrations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Verified,
    Mismatch { recorded: String, current: String },
    NotApplied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub id: MigrationId,
    pub name: String,
    pub strategy: Strategy,
    pub applied: bool,
    pub batch: Option<u32>,
    pub applied_at: Option<DateTime<Utc>>,
    pub checksum: ChecksumStatus,
    pub irreversible: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub rows: Vec<StatusRow>,
    /// Ledger entries whose migration is no longer defined.
    pub unknown: Vec<LedgerEntry>,
}

impl StatusReport {
    pub fn pending(&self) -> impl Iterator<Item = &StatusRow> {
        self.rows.iter().filter(|row| !row.applied)
    }

    pub fn has_drift(&self) -> bool {
        !self.unknown.is_empty()
            || self
                .rows
                .iter()
                .any(|row| matches!(row.checksum, ChecksumStatus::Mismatch { .. }))
    }
}

/// Bookkeeping written inside the current transaction, so a store that
/// cannot roll it back knows what to undo.
#[derive(Debug, Default)]
struct Written {
    ledger: bool,
    snapshot: bool,
}

type StepError = (Option<usize>, StoreError);

pub struct Migrator<'a, S: Store> {
    registry: &'a MigrationRegistry,
    store: S,
    config: MigratorConfig,
    cancel: CancellationToken,
}

impl<'a, S: Store> Migrator<'a, S> {
    pub fn new(registry: &'a MigrationRegistry, store: S) -> Self {
        Self {
            registry,
            store,
            config: MigratorConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: MigratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn registry(&self) -> &'a MigrationRegistry {
        self.registry
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Ledger entries, after checking each one against its definition.
    fn verified_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let entries = self.store.entries()?;
        for entry in &entries {
            let migration = self
                .registry
                .get(entry.migration_id)
                .ok_or(MigrationError::NotFound(entry.migration_id))?;
            if migration.checksum() != entry.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    migration: entry.migration_id,
                    recorded: entry.checksum.clone(),
                    current: migration.checksum().to_string(),
                });
            }
        }
        Ok(entries)
    }

    pub fn plan_up(&mut self, target: UpTarget) -> Result<Vec<&'a Migration>> {
        let registry = self.registry;
        let applied: BTreeSet<MigrationId> = self
            .verified_entries()?
            .into_iter()
            .map(|entry| entry.migration_id)
            .collect();
        let mut order = planner::plan(registry, &applied)?;

        if let UpTarget::To(target) = target {
            if !registry.contains(target) {
                return Err(MigrationError::NotFound(target));
            }
            if applied.contains(&target) {
                return Ok(Vec::new());
            }
            let position = order
                .iter()
                .position(|migration| migration.id() == target)
                .ok_or(MigrationError::NotFound(target))?;
            order.truncate(position + 1);
        }

        Ok(order)
    }

    /// Applied migrations selected by `target`, in the reverse of the order
    /// they were applied: later batches first, dependents before their
    /// dependencies within a batch.
    fn resolve_down(&mut self, target: DownTarget) -> Result<Vec<(&'a Migration, LedgerEntry)>> {
        let registry = self.registry;
        let mut entries: BTreeMap<MigrationId, LedgerEntry> = self
            .verified_entries()?
            .into_iter()
            .map(|entry| (entry.migration_id, entry))
            .collect();
        let applied: BTreeSet<MigrationId> = entries.keys().copied().collect();

        let mut order = planner::applied_order(registry, &applied)?;
        // stable, so the topological order survives inside each batch
        order.sort_by_key(|migration| entries.get(&migration.id()).map(|entry| entry.batch));
        order.reverse();

        let selected: Vec<&'a Migration> = match target {
            DownTarget::To(id) => order
                .into_iter()
                .filter(|migration| migration.id() > id)
                .collect(),
            DownTarget::Steps(n) => order.into_iter().take(n).collect(),
            DownTarget::LastBatch => {
                let last = entries.values().map(|entry| entry.batch).max();
                order
                    .into_iter()
                    .filter(|migration| {
                        entries.get(&migration.id()).map(|entry| entry.batch) == last
                    })
                    .collect()
            }
        };

        let reverting: BTreeSet<MigrationId> = selected.iter().map(|m| m.id()).collect();
        for &id in applied.difference(&reverting) {
            let Some(kept) = registry.get(id) else {
                continue;
            };
            if let Some(&dep) = kept.depends_on().iter().find(|dep| reverting.contains(*dep)) {
                return Err(MigrationError::DependentStillApplied {
                    migration: dep,
                    dependent: id,
                });
            }
        }

        if let Some(migration) = selected.iter().find(|m| m.is_irreversible()) {
            return Err(MigrationError::IrreversibleRollback(migration.id()));
        }

        let mut resolved = Vec::with_capacity(selected.len());
        for migration in selected {
            let entry = entries
                .remove(&migration.id())
                .ok_or(MigrationError::NotFound(migration.id()))?;
            resolved.push((migration, entry));
        }
        Ok(resolved)
    }

    /// Applied migrations `down` would revert, in revert order.
    pub fn plan_down(&mut self, target: DownTarget) -> Result<Vec<&'a Migration>> {
        Ok(self
            .resolve_down(target)?
            .into_iter()
            .map(|(migration, _)| migration)
            .collect())
    }

    /// SQL `up` would run, per migration, without touching the store.
    pub fn preview_up(&mut self, target: UpTarget) -> Result<Vec<(MigrationId, Vec<String>)>> {
        let order = self.plan_up(target)?;
        let backend = self.store.backend();
        order
            .into_iter()
            .map(|migration| -> Result<(MigrationId, Vec<String>)> {
                Ok((migration.id(), migration.up_sql(backend)?))
            })
            .collect()
    }

    pub fn preview_down(
        &mut self,
        target: DownTarget,
    ) -> Result<Vec<(MigrationId, Vec<String>)>> {
        let order = self.plan_down(target)?;
        let backend = self.store.backend();
        order
            .into_iter()
            .map(|migration| -> Result<(MigrationId, Vec<String>)> {
                let sql = migration
                    .down_sql(backend)?
                    .ok_or(MigrationError::IrreversibleRollback(migration.id()))?;
                Ok((migration.id(), sql))
            })
            .collect()
    }

    /// Applies pending migrations in planned order, each in its own
    /// transaction. Halts at the first failure.
    pub fn up(&mut self, target: UpTarget) -> Result<BatchReport> {
        self.with_lock(|migrator| migrator.run_up(target))
    }

    /// Reverts applied migrations in reverse application order, each in its
    /// own transaction. Nothing is reverted if any selected migration is
    /// irreversible, is still needed by a migration that stays applied, or
    /// cannot be projected onto the stored snapshot.
    pub fn down(&mut self, target: DownTarget) -> Result<BatchReport> {
        self.with_lock(|migrator| migrator.run_down(target))
    }

    pub fn status(&mut self) -> Result<StatusReport> {
        let entries = self.store.entries()?;
        let by_id: BTreeMap<MigrationId, &LedgerEntry> = entries
            .iter()
            .map(|entry| (entry.migration_id, entry))
            .collect();

        let rows = self
            .registry
            .all()
            .map(|migration| {
                let entry = by_id.get(&migration.id());
                let checksum = match entry {
                    None => ChecksumStatus::NotApplied,
                    Some(entry) if entry.checksum == migration.checksum() => {
                        ChecksumStatus::Verified
                    }
                    Some(entry) => ChecksumStatus::Mismatch {
                        recorded: entry.checksum.clone(),
                        current: migration.checksum().to_string(),
                    },
                };
                StatusRow {
                    id: migration.id(),
                    name: migration.name().to_string(),
                    strategy: migration.strategy(),
                    applied: entry.is_some(),
                    batch: entry.map(|entry| entry.batch),
                    applied_at: entry.map(|entry| entry.applied_at),
                    checksum,
                    irreversible: migration.is_irreversible(),
                }
            })
            .collect();

        let unknown = entries
            .iter()
            .filter(|entry| !self.registry.contains(entry.migration_id))
            .cloned()
            .collect();

        Ok(StatusReport { rows, unknown })
    }

    pub fn history(&mut self) -> Result<Vec<LedgerEntry>> {
        Ok(self.store.entries()?)
    }

    /// Builds a new migration for `request`. The result is not registered
    /// or applied; the caller persists it.
    pub fn generate(
        &mut self,
        request: GenerationRequest,
        now: DateTime<Utc>,
    ) -> Result<Migration> {
        let strategy = selector::select(&request, self.config.default_strategy)?;
        let name = request.name.clone();
        let source = MigrationSource::for_strategy(strategy, request)?;

        let ctx = GenerationContext {
            id: self.registry.next_id(now),
            name,
            depends_on: self.registry.default_dependencies(),
            baseline: self.projected_schema()?,
        };
        let migration = source.generate(&ctx)?;

        info!(
            migration = %migration.id(),
            name = migration.name(),
            strategy = %migration.strategy(),
            operations = migration.up_operations().len(),
            "generated migration"
        );
        Ok(migration)
    }

    /// The stored snapshot with every pending migration replayed on top, so
    /// a new migration starts from where the history will end up.
    fn projected_schema(&mut self) -> Result<SchemaSnapshot> {
        let applied = self.store.applied()?;
        let mut schema = self.store.load()?;
        for migration in planner::plan(self.registry, &applied)? {
            schema = schema.apply_all(migration.up_operations())?;
        }
        Ok(schema)
    }

    fn with_lock<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.config.validate()?;
        self.acquire_lock()?;

        let result = f(self);
        let released = self.store.unlock(&self.config.lock_name);

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Err(unlock_error)) => {
                warn!(error = %unlock_error, "failed to release migration lock");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    fn acquire_lock(&mut self) -> Result<()> {
        let name = self.config.lock_name.clone();
        let started = Instant::now();

        loop {
            if self.store.try_lock(&name)? {
                debug!(lock = %name, "acquired migration lock");
                return Ok(());
            }

            let waited = started.elapsed();
            match self.config.lock_mode {
                LockMode::FailFast => return Err(MigrationError::LockContention { waited }),
                LockMode::Wait {
                    timeout,
                    poll_interval,
                } => {
                    if waited >= timeout {
                        return Err(MigrationError::LockContention { waited });
                    }
                    debug!(lock = %name, ?waited, "migration lock busy, retrying");
                    thread::sleep(poll_interval.min(timeout - waited));
                }
            }
        }
    }

    fn run_up(&mut self, target: UpTarget) -> Result<BatchReport> {
        let order = self.plan_up(target)?;
        if order.is_empty() {
            info!("schema is up to date");
            return Ok(BatchReport::default());
        }

        let batch = self.store.next_batch()?;
        if !self.store.backend().supports_transactional_ddl() {
            warn!(
                backend = self.store.backend().name(),
                "backend commits DDL implicitly; a failed migration can leave partial changes"
            );
        }
        info!(batch, pending = order.len(), "applying migrations");

        let mut snapshot = self.store.load()?;
        let mut report = BatchReport {
            batch: Some(batch),
            ..BatchReport::default()
        };

        for migration in order {
            if self.cancel.is_cancelled() {
                info!(remaining_from = %migration.id(), "cancelled before next migration");
                report.cancelled = true;
                break;
            }

            let _span = info_span!(
                "migration_up",
                migration = %migration.id(),
                name = migration.name(),
                batch
            )
            .entered();

            let started = Instant::now();
            snapshot = self.apply_one(migration, batch, &snapshot, &report)?;
            report.outcomes.push(MigrationOutcome {
                id: migration.id(),
                name: migration.name().to_string(),
                state: MigrationState::Applied,
                duration: started.elapsed(),
            });
        }

        Ok(report)
    }

    fn apply_one(
        &mut self,
        migration: &Migration,
        batch: u32,
        current: &SchemaSnapshot,
        report: &BatchReport,
    ) -> Result<SchemaSnapshot> {
        transition(migration, MigrationState::Pending, MigrationState::Applying);

        let prepared = project(current, migration.up_operations())
            .and_then(|next| Ok((next, self.render(migration.up_operations())?)));
        let (next, statements) = match prepared {
            Ok(prepared) => prepared,
            Err((operation, error)) => {
                transition(migration, MigrationState::Applying, MigrationState::Failed);
                return Err(failure(migration, operation, error, report));
            }
        };

        let entry = LedgerEntry::new(migration, batch);
        let mut written = Written::default();
        let result = self.execute_up(&statements, &entry, &next, &mut written);

        match result {
            Ok(()) => {
                transition(migration, MigrationState::Applying, MigrationState::Applied);
                info!(statements = statements.len(), "applied migration");
                Ok(next)
            }
            Err((operation, error)) => {
                self.abort();
                if !self.store.rolls_back_bookkeeping() {
                    self.undo_up(migration.id(), current, &written);
                }
                transition(migration, MigrationState::Applying, MigrationState::Failed);

                if let StoreError::DuplicateEntry(id) = error {
                    return Err(MigrationError::DuplicateApply(id));
                }
                Err(failure(migration, operation, error.to_string(), report))
            }
        }
    }

    fn execute_up(
        &mut self,
        statements: &[(usize, String)],
        entry: &LedgerEntry,
        next: &SchemaSnapshot,
        written: &mut Written,
    ) -> std::result::Result<(), StepError> {
        self.store.begin().map_err(|e| (None, e))?;
        self.execute_all(statements)?;
        self.store.record(entry).map_err(|e| (None, e))?;
        written.ledger = true;
        self.store.save(next).map_err(|e| (None, e))?;
        written.snapshot = true;
        self.store.commit().map_err(|e| (None, e))
    }

    fn run_down(&mut self, target: DownTarget) -> Result<BatchReport> {
        let selected = self.resolve_down(target)?;
        if selected.is_empty() {
            info!("nothing to revert");
            return Ok(BatchReport::default());
        }
        info!(count = selected.len(), "reverting migrations");

        let mut snapshot = self.store.load()?;
        let mut report = BatchReport::default();

        let mut projected = snapshot.clone();
        for (migration, _) in &selected {
            projected = project(&projected, migration.down_operations())
                .map_err(|(operation, error)| failure(migration, operation, error, &report))?;
        }

        for (migration, entry) in selected {
            if self.cancel.is_cancelled() {
                info!(remaining_from = %migration.id(), "cancelled before next migration");
                report.cancelled = true;
                break;
            }

            let _span = info_span!(
                "migration_down",
                migration = %migration.id(),
                name = migration.name(),
                batch = entry.batch
            )
            .entered();

            let started = Instant::now();
            snapshot = self.revert_one(migration, &entry, &snapshot, &report)?;
            report.outcomes.push(MigrationOutcome {
                id: migration.id(),
                name: migration.name().to_string(),
                state: MigrationState::Reverted,
                duration: started.elapsed(),
            });
        }

        Ok(report)
    }

    fn revert_one(
        &mut self,
        migration: &Migration,
        entry: &LedgerEntry,
        current: &SchemaSnapshot,
        report: &BatchReport,
    ) -> Result<SchemaSnapshot> {
        transition(migration, MigrationState::Applied, MigrationState::Reverting);

        let prepared = project(current, migration.down_operations())
            .and_then(|next| Ok((next, self.render(migration.down_operations())?)));
        let (next, statements) = match prepared {
            Ok(prepared) => prepared,
            Err((operation, error)) => {
                transition(migration, MigrationState::Reverting, MigrationState::Failed);
                return Err(failure(migration, operation, error, report));
            }
        };

        let mut written = Written::default();
        let result = self.execute_down(&statements, migration.id(), &next, &mut written);

        match result {
            Ok(()) => {
                transition(migration, MigrationState::Reverting, MigrationState::Reverted);
                info!(statements = statements.len(), "reverted migration");
                Ok(next)
            }
            Err((operation, error)) => {
                self.abort();
                if !self.store.rolls_back_bookkeeping() {
                    self.undo_down(entry, current, &written);
                }
                transition(migration, MigrationState::Reverting, MigrationState::Failed);
                Err(failure(migration, operation, error.to_string(), report))
            }
        }
    }

    fn execute_down(
        &mut self,
        statements: &[(usize, String)],
        id: MigrationId,
        next: &SchemaSnapshot,
        written: &mut Written,
    ) -> std::result::Result<(), StepError> {
        self.store.begin().map_err(|e| (None, e))?;
        self.execute_all(statements)?;
        self.store.erase(id).map_err(|e| (None, e))?;
        written.ledger = true;
        self.store.save(next).map_err(|e| (None, e))?;
        written.snapshot = true;
        self.store.commit().map_err(|e| (None, e))
    }

    fn execute_all(
        &mut self,
        statements: &[(usize, String)],
    ) -> std::result::Result<(), StepError> {
        for (index, sql) in statements {
            debug!(operation = *index, %sql, "executing statement");
            self.store
                .execute(sql)
                .map_err(|e| (Some(*index), e))?;
        }
        Ok(())
    }

    /// SQL for each operation, tagged with the operation's index.
    fn render(
        &self,
        operations: &[Operation],
    ) -> std::result::Result<Vec<(usize, String)>, (Option<usize>, String)> {
        let backend = self.store.backend();
        let mut statements = Vec::new();
        for (index, operation) in operations.iter().enumerate() {
            let sqls = operation
                .to_sql(backend)
                .map_err(|e| (Some(index), e.to_string()))?;
            statements.extend(sqls.into_iter().map(|sql| (index, sql)));
        }
        Ok(statements)
    }

    fn abort(&mut self) {
        if let Err(e) = self.store.rollback() {
            warn!(error = %e, "rollback failed");
        }
    }

    fn undo_up(&mut self, id: MigrationId, previous: &SchemaSnapshot, written: &Written) {
        if written.ledger {
            warn!(migration = %id, "removing ledger entry left by failed migration");
            match self.store.erase(id) {
                Ok(()) | Err(StoreError::MissingEntry(_)) => {}
                Err(e) => warn!(migration = %id, error = %e, "could not remove ledger entry"),
            }
        }
        if written.snapshot {
            self.restore_snapshot(previous);
        }
    }

    fn undo_down(&mut self, entry: &LedgerEntry, previous: &SchemaSnapshot, written: &Written) {
        if written.ledger {
            let id = entry.migration_id;
            warn!(migration = %id, "restoring ledger entry erased by failed rollback");
            match self.store.record(entry) {
                Ok(()) | Err(StoreError::DuplicateEntry(_)) => {}
                Err(e) => warn!(migration = %id, error = %e, "could not restore ledger entry"),
            }
        }
        if written.snapshot {
            self.restore_snapshot(previous);
        }
    }

    fn restore_snapshot(&mut self, previous: &SchemaSnapshot) {
        warn!("restoring previous schema snapshot");
        if let Err(e) = self.store.save(previous) {
            warn!(error = %e, "could not restore schema snapshot");
        }
    }
}

/// `current` with `operations` applied, or the index of the first
/// operation that does not fit.
fn project(
    current: &SchemaSnapshot,
    operations: &[Operation],
) -> std::result::Result<SchemaSnapshot, (Option<usize>, String)> {
    let mut next = current.clone();
    for (index, operation) in operations.iter().enumerate() {
        operation
            .apply(&mut next)
            .map_err(|e| (Some(index), e.to_string()))?;
    }
    Ok(next)
}

fn failure(
    migration: &Migration,
    operation: Option<usize>,
    error: String,
    report: &BatchReport,
) -> MigrationError {
    MigrationError::ExecutionFailed {
        migration: migration.id(),
        operation,
        error,
        completed: report.completed(),
    }
}

fn transition(migration: &Migration, from: MigrationState, to: MigrationState) {
    debug!(migration = %migration.id(), ?from, ?to, "state change");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MySql;
    use crate::field::{Field, FieldType};
    use crate::ledger::VersionLedger;
    use crate::operation::{AddColumn, CreateTable, DropTable, RawStatement};
    use crate::schema::TableSchema;
    use crate::snapshot::SnapshotStore;
    use crate::store::{MemoryStore, StoreConnection};

    fn id(raw: u64) -> MigrationId {
        MigrationId::new(raw)
    }

    fn create_table(n: u64, table: &str) -> Migration {
        Migration::raw(id(n), format!("create_{}", table))
            .operation(
                CreateTable::new(table)
                    .add_column(Field::new("id", FieldType::Serial).primary_key()),
            )
            .build()
            .unwrap()
    }

    fn setup_registry() -> MigrationRegistry {
        let mut registry = MigrationRegistry::new();
        registry.register(create_table(1, "users")).unwrap();
        registry
            .register(
                Migration::raw(id(2), "add_email")
                    .operation(AddColumn::new("users", Field::new("email", FieldType::Text)))
                    .depends_on([id(1)])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn users_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new().with_table(
            "users",
            TableSchema::new(vec![
                Field::new("id", FieldType::Serial).primary_key(),
                Field::new("email", FieldType::Text),
            ]),
        )
    }

    #[test]
    fn up_applies_pending_in_order() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());

        let report = migrator.up(UpTarget::Latest).unwrap();

        assert_eq!(report.batch, Some(1));
        assert_eq!(report.completed(), vec![id(1), id(2)]);
        assert!(report
            .outcomes
            .iter()
            .all(|outcome| outcome.state == MigrationState::Applied));

        let store = migrator.store_mut();
        assert_eq!(store.load().unwrap(), users_snapshot());
        assert_eq!(store.executed().len(), 2);
        assert!(store.executed()[0].contains("CREATE TABLE"));
        assert!(!store.is_locked("schemaflow"));
    }

    #[test]
    fn up_is_idempotent() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();
        let history = migrator.history().unwrap();

        let report = migrator.up(UpTarget::Latest).unwrap();

        assert!(report.is_empty());
        assert_eq!(report.batch, None);
        assert_eq!(migrator.history().unwrap(), history);
        assert_eq!(migrator.store_mut().load().unwrap(), users_snapshot());
    }

    #[test]
    fn up_to_target_stops_there() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());

        let report = migrator.up(UpTarget::To(id(1))).unwrap();
        assert_eq!(report.completed(), vec![id(1)]);

        // already applied target is a no-op
        assert!(migrator.up(UpTarget::To(id(1))).unwrap().is_empty());
        assert!(matches!(
            migrator.up(UpTarget::To(id(9))),
            Err(MigrationError::NotFound(missing)) if missing == id(9)
        ));
    }

    #[test]
    fn separate_runs_get_separate_batches() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::To(id(1))).unwrap();
        migrator.up(UpTarget::Latest).unwrap();

        let batches: Vec<u32> = migrator.history().unwrap().iter().map(|e| e.batch).collect();
        assert_eq!(batches, vec![1, 2]);
    }

    #[test]
    fn up_then_down_restores_snapshot() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::To(id(1))).unwrap();
        let before = migrator.store_mut().load().unwrap();

        migrator.up(UpTarget::Latest).unwrap();
        let report = migrator.down(DownTarget::Steps(1)).unwrap();

        assert_eq!(report.completed(), vec![id(2)]);
        assert_eq!(report.outcomes[0].state, MigrationState::Reverted);
        assert_eq!(migrator.store_mut().load().unwrap(), before);
        assert_eq!(migrator.store_mut().applied().unwrap().len(), 1);
    }

    #[test]
    fn down_to_target_keeps_target_applied() {
        let mut registry = setup_registry();
        registry.register(create_table(3, "orders")).unwrap();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();

        let report = migrator.down(DownTarget::To(id(1))).unwrap();

        assert_eq!(report.completed(), vec![id(3), id(2)]);
        let applied: Vec<_> = migrator.store_mut().applied().unwrap().into_iter().collect();
        assert_eq!(applied, vec![id(1)]);
    }

    #[test]
    fn down_last_batch() {
        let mut registry = setup_registry();
        registry.register(create_table(3, "orders")).unwrap();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::To(id(1))).unwrap();
        migrator.up(UpTarget::Latest).unwrap();

        let planned: Vec<_> = migrator
            .plan_down(DownTarget::LastBatch)
            .unwrap()
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(planned, vec![id(3), id(2)]);

        migrator.down(DownTarget::LastBatch).unwrap();
        assert_eq!(migrator.history().unwrap().len(), 1);
    }

    #[test]
    fn irreversible_rollback_touches_nothing() {
        let mut registry = setup_registry();
        registry
            .register(
                Migration::raw(id(3), "drop_users")
                    .operation(DropTable::new("users"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();
        let executed = migrator.store().executed().len();

        assert!(matches!(
            migrator.down(DownTarget::Steps(2)),
            Err(MigrationError::IrreversibleRollback(irreversible)) if irreversible == id(3)
        ));
        assert_eq!(migrator.history().unwrap().len(), 3);
        assert_eq!(migrator.store().executed().len(), executed);
    }

    fn out_of_order_registry() -> MigrationRegistry {
        // 1 adds a column to the table 3 creates
        let mut registry = MigrationRegistry::new();
        registry
            .register(
                Migration::raw(id(1), "add_code")
                    .operation(AddColumn::new("items", Field::new("code", FieldType::Text)))
                    .depends_on([id(3)])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.register(create_table(3, "items")).unwrap();
        registry
    }

    #[test]
    fn down_reverts_dependents_before_their_dependencies() {
        let registry = out_of_order_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        assert_eq!(migrator.up(UpTarget::Latest).unwrap().completed(), vec![id(3), id(1)]);

        let report = migrator.down(DownTarget::Steps(1)).unwrap();
        assert_eq!(report.completed(), vec![id(1)]);
        let snapshot = migrator.store_mut().load().unwrap();
        assert!(snapshot.table("items").unwrap().column("code").is_none());

        let report = migrator.down(DownTarget::Steps(1)).unwrap();
        assert_eq!(report.completed(), vec![id(3)]);
        assert!(migrator.store_mut().load().unwrap().is_empty());
        assert!(migrator.history().unwrap().is_empty());
    }

    #[test]
    fn down_steps_covering_both_runs_in_dependency_order() {
        let registry = out_of_order_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();

        let report = migrator.down(DownTarget::Steps(2)).unwrap();

        assert_eq!(report.completed(), vec![id(1), id(3)]);
        assert!(migrator.store_mut().load().unwrap().is_empty());
        assert!(migrator.history().unwrap().is_empty());
    }

    #[test]
    fn down_refuses_to_strand_a_dependent() {
        let registry = out_of_order_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();
        let executed = migrator.store().executed().len();

        assert!(matches!(
            migrator.down(DownTarget::To(id(2))),
            Err(MigrationError::DependentStillApplied { migration, dependent })
                if migration == id(3) && dependent == id(1)
        ));
        assert_eq!(migrator.history().unwrap().len(), 2);
        assert_eq!(migrator.store().executed().len(), executed);
        assert!(!migrator.store().is_locked("schemaflow"));
    }

    #[test]
    fn down_projects_every_migration_before_executing() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(
                Migration::raw(id(1), "drop_ghost")
                    .up(vec![])
                    .down(vec![DropTable::new("ghost").into()])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry.register(create_table(2, "users")).unwrap();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();
        let executed = migrator.store().executed().len();

        // 2 would revert cleanly; 1 cannot, so neither runs
        match migrator.down(DownTarget::To(id(0))) {
            Err(MigrationError::ExecutionFailed {
                migration,
                operation,
                completed,
                ..
            }) => {
                assert_eq!(migration, id(1));
                assert_eq!(operation, Some(0));
                assert!(completed.is_empty());
            }
            other => panic!("expected execution failure, got {:?}", other),
        }
        assert_eq!(migrator.history().unwrap().len(), 2);
        assert_eq!(migrator.store().executed().len(), executed);
        assert!(migrator.store_mut().load().unwrap().table("users").is_some());
    }

    #[test]
    fn failure_halts_batch_and_keeps_earlier_migrations() {
        let mut registry = setup_registry();
        registry.register(create_table(3, "orders")).unwrap();
        registry.register(create_table(4, "invoices")).unwrap();
        let store = MemoryStore::new().fail_on("\"orders\"");
        let mut migrator = Migrator::new(&registry, store);

        let err = migrator.up(UpTarget::Latest).unwrap_err();

        match err {
            MigrationError::ExecutionFailed {
                migration,
                operation,
                completed,
                ..
            } => {
                assert_eq!(migration, id(3));
                assert_eq!(operation, Some(0));
                assert_eq!(completed, vec![id(1), id(2)]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let store = migrator.store_mut();
        let applied: Vec<_> = store.applied().unwrap().into_iter().collect();
        assert_eq!(applied, vec![id(1), id(2)]);
        assert_eq!(store.load().unwrap(), users_snapshot());
        assert!(!store.is_locked("schemaflow"));
    }

    #[test]
    fn failed_snapshot_save_undoes_ledger_entry() {
        let registry = setup_registry();
        let store = MemoryStore::new().fail_snapshot_saves();
        let mut migrator = Migrator::new(&registry, store);

        let err = migrator.up(UpTarget::Latest).unwrap_err();

        assert!(matches!(
            err,
            MigrationError::ExecutionFailed { migration, operation: None, .. } if migration == id(1)
        ));
        assert!(migrator.history().unwrap().is_empty());
        assert!(migrator.store().executed().is_empty());
    }

    #[test]
    fn structural_error_fails_before_touching_store() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(
                Migration::raw(id(1), "add_to_missing")
                    .operation(AddColumn::new("ghost", Field::new("x", FieldType::Text)))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());

        assert!(matches!(
            migrator.up(UpTarget::Latest),
            Err(MigrationError::ExecutionFailed { operation: Some(0), .. })
        ));
        assert!(migrator.store().executed().is_empty());
    }

    #[test]
    fn renders_sql_for_the_store_backend() {
        let mut registry = MigrationRegistry::new();
        registry.register(create_table(1, "users")).unwrap();
        let mut migrator = Migrator::new(&registry, MemoryStore::with_backend(MySql));

        migrator.up(UpTarget::Latest).unwrap();
        assert!(migrator.store().executed()[0].contains('`'));
    }

    #[test]
    fn checksum_mismatch_blocks_up_and_down() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::To(id(1))).unwrap();

        let mut entries = migrator.history().unwrap();
        entries[0].checksum = "edited".to_string();
        let ledger = crate::ledger::InMemoryLedger::with_entries(entries);
        let mut migrator = Migrator::new(&registry, MemoryStore::new().with_ledger(ledger));

        assert!(matches!(
            migrator.up(UpTarget::Latest),
            Err(MigrationError::ChecksumMismatch { migration, .. }) if migration == id(1)
        ));
        assert!(matches!(
            migrator.down(DownTarget::Steps(1)),
            Err(MigrationError::ChecksumMismatch { .. })
        ));
        assert!(migrator.store().executed().is_empty());

        let status = migrator.status().unwrap();
        assert!(status.has_drift());
        assert!(matches!(
            status.rows[0].checksum,
            ChecksumStatus::Mismatch { ref recorded, .. } if recorded == "edited"
        ));
        assert_eq!(status.rows[1].checksum, ChecksumStatus::NotApplied);
    }

    #[test]
    fn unknown_ledger_entry_is_not_found() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::Latest).unwrap();
        let history = migrator.history().unwrap();

        let mut smaller = MigrationRegistry::new();
        smaller.register(create_table(1, "users")).unwrap();
        let store =
            MemoryStore::new().with_ledger(crate::ledger::InMemoryLedger::with_entries(history));
        let mut migrator = Migrator::new(&smaller, store);

        assert!(matches!(
            migrator.up(UpTarget::Latest),
            Err(MigrationError::NotFound(missing)) if missing == id(2)
        ));
        assert_eq!(migrator.status().unwrap().unknown.len(), 1);
    }

    #[test]
    fn lock_contention_fails_fast() {
        let registry = setup_registry();
        let mut holder = MemoryStore::new();
        let store = MemoryStore::sharing_locks_with(&holder);
        assert!(holder.try_lock("schemaflow").unwrap());

        let mut migrator = Migrator::new(&registry, store);
        let err = migrator.up(UpTarget::Latest).unwrap_err();

        assert!(matches!(err, MigrationError::LockContention { .. }));
        assert!(err.is_transient());
        assert!(migrator.history().unwrap().is_empty());
        assert!(holder.is_locked("schemaflow"));
    }

    #[test]
    fn lock_wait_gives_up_after_timeout() {
        let registry = setup_registry();
        let mut holder = MemoryStore::new();
        assert!(holder.try_lock("schemaflow").unwrap());
        let config = MigratorConfig::new()
            .with_lock_wait(Duration::from_millis(30), Duration::from_millis(5));
        let mut migrator =
            Migrator::new(&registry, MemoryStore::sharing_locks_with(&holder)).with_config(config);

        match migrator.up(UpTarget::Latest) {
            Err(MigrationError::LockContention { waited }) => {
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("expected lock contention, got {:?}", other),
        }
    }

    #[test]
    fn cancellation_stops_between_migrations() {
        let registry = setup_registry();
        let token = CancellationToken::new();
        token.cancel();
        let mut migrator = Migrator::new(&registry, MemoryStore::new()).with_cancellation(token);

        let report = migrator.up(UpTarget::Latest).unwrap();

        assert!(report.cancelled);
        assert!(report.is_empty());
        assert!(migrator.history().unwrap().is_empty());
        assert!(!migrator.store().is_locked("schemaflow"));
    }

    #[test]
    fn duplicate_apply_is_fatal() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        migrator.up(UpTarget::To(id(1))).unwrap();
        let mut entries = migrator.history().unwrap();

        // a ledger that hides entry 1 from reads but still rejects it
        struct Sneaky(MemoryStore, LedgerEntry);
        impl StoreConnection for Sneaky {
            fn backend(&self) -> &dyn crate::backend::Backend {
                self.0.backend()
            }
            fn begin(&mut self) -> std::result::Result<(), StoreError> {
                self.0.begin()
            }
            fn commit(&mut self) -> std::result::Result<(), StoreError> {
                self.0.commit()
            }
            fn rollback(&mut self) -> std::result::Result<(), StoreError> {
                self.0.rollback()
            }
            fn execute(&mut self, sql: &str) -> std::result::Result<(), StoreError> {
                self.0.execute(sql)
            }
            fn try_lock(&mut self, name: &str) -> std::result::Result<bool, StoreError> {
                self.0.try_lock(name)
            }
            fn unlock(&mut self, name: &str) -> std::result::Result<(), StoreError> {
                self.0.unlock(name)
            }
        }
        impl VersionLedger for Sneaky {
            fn entries(&mut self) -> std::result::Result<Vec<LedgerEntry>, StoreError> {
                Ok(Vec::new())
            }
            fn record(&mut self, entry: &LedgerEntry) -> std::result::Result<(), StoreError> {
                if entry.migration_id == self.1.migration_id {
                    return Err(StoreError::DuplicateEntry(entry.migration_id));
                }
                self.0.record(entry)
            }
            fn erase(&mut self, id: MigrationId) -> std::result::Result<(), StoreError> {
                self.0.erase(id)
            }
        }
        impl SnapshotStore for Sneaky {
            fn load(&mut self) -> std::result::Result<SchemaSnapshot, StoreError> {
                self.0.load()
            }
            fn save(&mut self, snapshot: &SchemaSnapshot) -> std::result::Result<(), StoreError> {
                self.0.save(snapshot)
            }
        }

        let mut migrator = Migrator::new(&registry, Sneaky(MemoryStore::new(), entries.remove(0)));
        assert!(matches!(
            migrator.up(UpTarget::Latest),
            Err(MigrationError::DuplicateApply(dup)) if dup == id(1)
        ));
    }

    #[test]
    fn preview_does_not_touch_store() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());

        let preview = migrator.preview_up(UpTarget::Latest).unwrap();

        assert_eq!(preview.len(), 2);
        assert_eq!(preview[0].0, id(1));
        assert!(preview[1].1[0].contains("ALTER TABLE"));
        assert!(migrator.store().executed().is_empty());

        migrator.up(UpTarget::Latest).unwrap();
        let down = migrator.preview_down(DownTarget::Steps(2)).unwrap();
        assert_eq!(down[0].0, id(2));
        assert!(down[1].1[0].contains("DROP TABLE"));
    }

    #[test]
    fn generate_starts_from_projected_schema() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        // nothing applied yet, but the model already matches the pending history
        let model = users_snapshot().with_table(
            "orders",
            TableSchema::new(vec![Field::new("id", FieldType::Serial).primary_key()]),
        );
        let migration = migrator
            .generate(GenerationRequest::new("add_orders").from_model(model), now)
            .unwrap();

        assert_eq!(migration.strategy(), Strategy::ModelDiff);
        assert_eq!(migration.up_operations().len(), 1);
        assert_eq!(migration.depends_on().iter().copied().collect::<Vec<_>>(), vec![id(2)]);
        assert!(migration.id() > id(2));
    }

    #[test]
    fn generate_raw_script() {
        let registry = setup_registry();
        let mut migrator = Migrator::new(&registry, MemoryStore::new());

        let migration = migrator
            .generate(
                GenerationRequest::new("backfill").raw(
                    vec![RawStatement::new("UPDATE users SET email = ''").into()],
                    Some(vec![]),
                ),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(migration.strategy(), Strategy::RawScript);
        assert!(migration.is_irreversible());
    }
}
