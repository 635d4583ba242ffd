use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::SchemaError;
use crate::field::Field;
use crate::operation::Operation;
use crate::schema::SchemaSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddColumn {
    pub table: String,
    pub column: Field,
}

impl AddColumn {
    pub fn new(table: impl Into<String>, column: Field) -> Self {
        Self {
            table: table.into(),
            column,
        }
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        vec![backend.add_column_sql(&self.table, &self.column)]
    }

    pub(crate) fn invert(&self) -> Operation {
        DropColumn::new(self.table.clone(), self.column.name.clone()).into()
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        let table = snapshot.table_mut(&self.table)?;
        if table.column(&self.column.name).is_some() {
            return Err(SchemaError::ColumnExists {
                table: self.table.clone(),
                column: self.column.name.clone(),
            });
        }
        table.columns.push(self.column.clone());
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!("Add column {} to {}", self.column.name, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropColumn {
    pub table: String,
    pub column: String,
}

impl DropColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        vec![backend.drop_column_sql(&self.table, &self.column)]
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        let table = snapshot.table_mut(&self.table)?;
        let position = table
            .columns
            .iter()
            .position(|c| c.name == self.column)
            .ok_or_else(|| SchemaError::UnknownColumn {
                table: self.table.clone(),
                column: self.column.clone(),
            })?;
        table.columns.remove(position);
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!("Drop column {} from {}", self.column, self.table)
    }
}

/// Replaces a column's type, nullability or default. Carrying the previous
/// definition is what makes the change reversible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterColumn {
    pub table: String,
    pub column: Field,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Field>,
}

impl AlterColumn {
    pub fn new(table: impl Into<String>, column: Field) -> Self {
        Self {
            table: table.into(),
            column,
            previous: None,
        }
    }

    pub fn from_previous(mut self, previous: Field) -> Self {
        self.previous = Some(previous);
        self
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Option<Vec<String>> {
        backend.alter_column_sql(&self.table, &self.column, self.previous.as_ref())
    }

    pub(crate) fn invert(&self) -> Option<Operation> {
        self.previous.as_ref().map(|previous| {
            AlterColumn::new(self.table.clone(), previous.clone())
                .from_previous(self.column.clone())
                .into()
        })
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        let table = snapshot.table_mut(&self.table)?;
        let existing = table
            .columns
            .iter_mut()
            .find(|c| c.name == self.column.name)
            .ok_or_else(|| SchemaError::UnknownColumn {
                table: self.table.clone(),
                column: self.column.name.clone(),
            })?;
        *existing = self.column.clone();
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!("Alter column {} on {}", self.column.name, self.table)
    }
}
