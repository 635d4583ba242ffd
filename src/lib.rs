pub mod backend;
pub mod command;
pub mod config;
pub mod definition;
pub mod error;
pub mod field;
pub mod ledger;
pub mod migration;
pub mod migrator;
pub mod operation;
pub mod planner;
pub mod schema;
pub mod selector;
pub mod snapshot;
pub mod source;
pub mod store;

pub mod prelude {
    pub use crate::backend::{Backend, MySql, Postgres, Sqlite};
    pub use crate::config::{LockMode, MigratorConfig};
    pub use crate::definition::DefinitionStore;
    pub use crate::error::{MigrationError, SchemaError, StoreError};
    pub use crate::field::{Field, FieldType, ForeignKey, ReferentialAction};
    pub use crate::ledger::{InMemoryLedger, LedgerEntry, VersionLedger};
    pub use crate::migration::{Migration, MigrationId, MigrationRegistry, Strategy};
    pub use crate::migrator::{
        BatchReport, CancellationToken, ChecksumStatus, DownTarget, MigrationState, Migrator,
        StatusReport, UpTarget,
    };
    pub use crate::operation::{
        AddColumn, AlterColumn, CreateIndex, CreateTable, DropColumn, DropIndex, DropTable, Index,
        IndexOrder, Operation, RawStatement,
    };
    pub use crate::schema::{ModelSchema, SchemaSnapshot, TableSchema};
    pub use crate::selector::{GenerationRequest, StrategyPreference};
    pub use crate::snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};
    pub use crate::store::{MemoryStore, Store, StoreConnection};

    #[cfg(feature = "sqlite")]
    pub use crate::store::SqliteStore;

    #[cfg(feature = "postgres")]
    pub use crate::store::PostgresStore;

    #[cfg(feature = "mysql")]
    pub use crate::store::MySqlStore;
}
