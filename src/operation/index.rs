use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::SchemaError;
use crate::operation::Operation;
use crate::schema::SchemaSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<(String, IndexOrder)>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            unique: false,
        }
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push((name.into(), IndexOrder::Asc));
        self
    }

    pub fn column_desc(mut self, name: impl Into<String>) -> Self {
        self.columns.push((name.into(), IndexOrder::Desc));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIndex {
    pub table: String,
    pub index: Index,
}

impl CreateIndex {
    pub fn new(table: impl Into<String>, index: Index) -> Self {
        Self {
            table: table.into(),
            index,
        }
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        vec![backend.create_index_sql(&self.table, &self.index)]
    }

    pub(crate) fn invert(&self) -> Operation {
        DropIndex::new(self.table.clone(), self.index.name.clone())
            .with_definition(self.index.clone())
            .into()
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        let table = snapshot.table_mut(&self.table)?;
        if table.indexes.contains_key(&self.index.name) {
            return Err(SchemaError::IndexExists {
                table: self.table.clone(),
                index: self.index.name.clone(),
            });
        }
        if let Some((missing, _)) = self
            .index
            .columns
            .iter()
            .find(|(name, _)| table.column(name).is_none())
        {
            return Err(SchemaError::UnknownColumn {
                table: self.table.clone(),
                column: missing.clone(),
            });
        }
        table
            .indexes
            .insert(self.index.name.clone(), self.index.clone());
        Ok(())
    }

    pub fn describe(&self) -> String {
        format!("Create index {} on {}", self.index.name, self.table)
    }
}

/// Drops an index by name. Only reversible when the dropped definition
/// travels with the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropIndex {
    pub table: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<Index>,
}

impl DropIndex {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
            definition: None,
        }
    }

    pub fn with_definition(mut self, index: Index) -> Self {
        self.definition = Some(index);
        self
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        vec![backend.drop_index_sql(&self.table, &self.name)]
    }

    pub(crate) fn invert(&self) -> Option<Operation> {
        self.definition
            .as_ref()
            .map(|index| CreateIndex::new(self.table.clone(), index.clone()).into())
    }

    pub(crate) fn apply(&self, snapshot: &mut SchemaSnapshot) -> Result<(), SchemaError> {
        let table = snapshot.table_mut(&self.table)?;
        table
            .indexes
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| SchemaError::UnknownIndex {
                table: self.table.clone(),
                index: self.name.clone(),
            })
    }

    pub fn describe(&self) -> String {
        format!("Drop index {} from {}", self.name, self.table)
    }
}
