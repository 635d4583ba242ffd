use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::SchemaError;
use crate::field::{Field, FieldType};
use crate::operation::Operation;
use crate::schema::{SchemaSnapshot, TableSchema};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<Field>,
}

impl CreateTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.columns.push(Field::new(name, field_type));
        self
    }

    pub fn add_column(mut self, column: Field) -> Self {
        self.columns.push(column);
        self
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        vec![backend.create_table_sql(&self.name, &self.columns)]
    }

    pub(crate) fn invert(&self) -> Operation {
        DropTable::new(self.name.clone()).into()
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        snapshot.insert_table(&self.name, TableSchema::new(self.columns.clone()))
    }

    pub fn describe(&self) -> String {
        format!("Create table {}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTable {
    pub name: String,
}

impl DropTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        vec![backend.drop_table_sql(&self.name)]
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        snapshot.remove_table(&self.name).map(|_| ())
    }

    pub fn describe(&self) -> String {
        format!("Drop table {}", self.name)
    }
}
