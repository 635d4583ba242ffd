mod diff;

pub use diff::diff;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, SchemaError};
use crate::field::Field;
use crate::operation::{Index, Operation};

/// Structural description of a store: tables, their columns in declaration
/// order, and their indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    #[serde(default)]
    pub tables: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Field>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indexes: BTreeMap<String, Index>,
}

impl TableSchema {
    pub fn new(columns: Vec<Field>) -> Self {
        Self {
            columns,
            indexes: BTreeMap::new(),
        }
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Field> {
        self.columns.iter().find(|c| c.name == name)
    }
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: TableSchema) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema, SchemaError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    pub fn insert_table(&mut self, name: &str, table: TableSchema) -> Result<(), SchemaError> {
        if self.tables.contains_key(name) {
            return Err(SchemaError::TableExists(name.to_string()));
        }
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    pub fn remove_table(&mut self, name: &str) -> Result<TableSchema, SchemaError> {
        self.tables
            .remove(name)
            .ok_or_else(|| SchemaError::UnknownTable(name.to_string()))
    }

    /// Applies `operations` in order to a copy of this snapshot. The
    /// original is left untouched when any operation fails.
    pub fn apply_all(&self, operations: &[Operation]) -> Result<SchemaSnapshot, SchemaError> {
        let mut next = self.clone();
        for op in operations {
            op.apply(&mut next)?;
        }
        Ok(next)
    }
}

/// Supplies the declared data model that model-diff migrations compare
/// against the remembered schema.
pub trait ModelSchema {
    fn current_schema_description(&self) -> Result<SchemaSnapshot, MigrationError>;
}

impl ModelSchema for SchemaSnapshot {
    fn current_schema_description(&self) -> Result<SchemaSnapshot, MigrationError> {
        Ok(self.clone())
    }
}
