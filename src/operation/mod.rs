mod column;
mod index;
mod raw;
mod table;

pub use column::{AddColumn, AlterColumn, DropColumn};
pub use index::{CreateIndex, DropIndex, Index, IndexOrder};
pub use raw::RawStatement;
pub use table::{CreateTable, DropTable};

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{MigrationError, SchemaError};
use crate::schema::SchemaSnapshot;

/// One structural change. Both authoring strategies emit this vocabulary,
/// so replaying a history never depends on how a migration was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateTable(CreateTable),
    DropTable(DropTable),
    AddColumn(AddColumn),
    DropColumn(DropColumn),
    AlterColumn(AlterColumn),
    CreateIndex(CreateIndex),
    DropIndex(DropIndex),
    RawStatement(RawStatement),
}

impl Operation {
    pub fn to_sql(&self, backend: &dyn Backend) -> Result<Vec<String>, MigrationError> {
        let sqls = match self {
            Operation::CreateTable(op) => op.to_sql(backend),
            Operation::DropTable(op) => op.to_sql(backend),
            Operation::AddColumn(op) => op.to_sql(backend),
            Operation::DropColumn(op) => op.to_sql(backend),
            Operation::AlterColumn(op) => {
                op.to_sql(backend)
                    .ok_or_else(|| MigrationError::UnsupportedOperation {
                        backend: backend.name(),
                        operation: op.describe(),
                    })?
            }
            Operation::CreateIndex(op) => op.to_sql(backend),
            Operation::DropIndex(op) => op.to_sql(backend),
            Operation::RawStatement(op) => op.to_sql(backend),
        };
        Ok(sqls)
    }

    /// The structural inverse, or `None` when the change destroys
    /// information that cannot be regenerated.
    pub fn invert(&self) -> Option<Operation> {
        match self {
            Operation::CreateTable(op) => Some(op.invert()),
            Operation::DropTable(_) => None,
            Operation::AddColumn(op) => Some(op.invert()),
            Operation::DropColumn(_) => None,
            Operation::AlterColumn(op) => op.invert(),
            Operation::CreateIndex(op) => Some(op.invert()),
            Operation::DropIndex(op) => op.invert(),
            Operation::RawStatement(_) => None,
        }
    }

    pub fn is_reversible(&self) -> bool {
        self.invert().is_some()
    }

    pub fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        match self {
            Operation::CreateTable(op) => op.apply(snapshot),
            Operation::DropTable(op) => op.apply(snapshot),
            Operation::AddColumn(op) => op.apply(snapshot),
            Operation::DropColumn(op) => op.apply(snapshot),
            Operation::AlterColumn(op) => op.apply(snapshot),
            Operation::CreateIndex(op) => op.apply(snapshot),
            Operation::DropIndex(op) => op.apply(snapshot),
            // opaque to the snapshot
            Operation::RawStatement(_) => Ok(()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operation::CreateTable(op) => op.describe(),
            Operation::DropTable(op) => op.describe(),
            Operation::AddColumn(op) => op.describe(),
            Operation::DropColumn(op) => op.describe(),
            Operation::AlterColumn(op) => op.describe(),
            Operation::CreateIndex(op) => op.describe(),
            Operation::DropIndex(op) => op.describe(),
            Operation::RawStatement(op) => op.describe(),
        }
    }

    /// Table the operation changes. Raw statements have no known target.
    pub fn table(&self) -> Option<&str> {
        match self {
            Operation::CreateTable(op) => Some(&op.name),
            Operation::DropTable(op) => Some(&op.name),
            Operation::AddColumn(op) => Some(&op.table),
            Operation::DropColumn(op) => Some(&op.table),
            Operation::AlterColumn(op) => Some(&op.table),
            Operation::CreateIndex(op) => Some(&op.table),
            Operation::DropIndex(op) => Some(&op.table),
            Operation::RawStatement(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Operation::RawStatement(_))
    }
}

macro_rules! impl_from_operation {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Operation {
                fn from(op: $variant) -> Self {
                    Operation::$variant(op)
                }
            }
        )*
    };
}

impl_from_operation!(
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AlterColumn,
    CreateIndex,
    DropIndex,
    RawStatement,
);
