use std::time::Duration;

use thiserror::Error;

use crate::migration::MigrationId;

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration not found: {0}")]
    NotFound(MigrationId),

    #[error(
        "Checksum mismatch for migration {migration}: ledger recorded {recorded}, definition now hashes to {current}"
    )]
    ChecksumMismatch {
        migration: MigrationId,
        recorded: String,
        current: String,
    },

    #[error("Circular dependency detected between: {}", join_ids(.0))]
    DependencyCycle(Vec<MigrationId>),

    #[error("Migration is not reversible: {0}")]
    IrreversibleRollback(MigrationId),

    #[error("Cannot revert migration {migration}: {dependent} depends on it and stays applied")]
    DependentStillApplied {
        migration: MigrationId,
        dependent: MigrationId,
    },

    #[error(
        "Migration {migration} failed{}: {error}{}",
        at_operation(.operation),
        completed_suffix(.completed)
    )]
    ExecutionFailed {
        migration: MigrationId,
        /// Index into the migration's operation list, when an operation failed.
        operation: Option<usize>,
        error: String,
        /// Migrations that were committed before the failure.
        completed: Vec<MigrationId>,
    },

    #[error("Migration in progress: lock held by another process (waited {waited:?})")]
    LockContention { waited: Duration },

    #[error("Migration {0} is already recorded in the ledger")]
    DuplicateApply(MigrationId),

    #[error(
        "Migrations {first} and {second} both change table {table} with different strategies and no dependency between them"
    )]
    StructuralConflict {
        table: String,
        first: MigrationId,
        second: MigrationId,
    },

    #[error("Invalid migration {name}: {reason}")]
    InvalidMigration { name: String, reason: String },

    #[error("Unsupported change to {table}.{column}: {reason}")]
    UnsupportedChange {
        table: String,
        column: String,
        reason: String,
    },

    #[error("The {backend} backend cannot run: {operation}")]
    UnsupportedOperation {
        backend: &'static str,
        operation: String,
    },

    #[error("No changes detected between the model and the current schema")]
    NoChanges,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// Short category name shown by the command surface.
    pub fn category(&self) -> &'static str {
        match self {
            MigrationError::NotFound(_) => "NotFound",
            MigrationError::ChecksumMismatch { .. } => "ChecksumMismatch",
            MigrationError::DependencyCycle(_) => "DependencyCycle",
            MigrationError::IrreversibleRollback(_) => "IrreversibleRollback",
            MigrationError::DependentStillApplied { .. } => "DependentStillApplied",
            MigrationError::ExecutionFailed { .. } => "OperationExecutionFailure",
            MigrationError::LockContention { .. } => "LockContention",
            MigrationError::DuplicateApply(_) => "DuplicateApply",
            MigrationError::StructuralConflict { .. } => "StructuralConflict",
            MigrationError::InvalidMigration { .. } => "InvalidMigration",
            MigrationError::UnsupportedChange { .. } => "UnsupportedChange",
            MigrationError::UnsupportedOperation { .. } => "UnsupportedOperation",
            MigrationError::NoChanges => "NoChanges",
            MigrationError::Configuration(_) => "Configuration",
            MigrationError::Schema(_) => "Schema",
            MigrationError::Store(_) => "Storage",
        }
    }

    /// Lock contention is the only category that is safe to retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrationError::LockContention { .. })
    }
}

/// Structural errors raised while applying operations to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("column {column} already exists on {table}")]
    ColumnExists { table: String, column: String },
    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("index {index} already exists on {table}")]
    IndexExists { table: String, index: String },
    #[error("index {index} does not exist on {table}")]
    UnknownIndex { table: String, index: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] postgres::Error),

    #[cfg(feature = "mysql")]
    #[error(transparent)]
    MySql(#[from] mysql::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("ledger already contains migration {0}")]
    DuplicateEntry(MigrationId),

    #[error("ledger has no entry for migration {0}")]
    MissingEntry(MigrationId),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Rejected(String),
}

fn join_ids(ids: &[MigrationId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn at_operation(operation: &Option<usize>) -> String {
    match operation {
        Some(index) => format!(" at operation {}", index),
        None => String::new(),
    }
}

fn completed_suffix(completed: &[MigrationId]) -> String {
    if completed.is_empty() {
        String::new()
    } else {
        format!(" (completed: {})", join_ids(completed).replace(" -> ", ", "))
    }
}
