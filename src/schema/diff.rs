use std::collections::{BTreeMap, BTreeSet};

use crate::error::MigrationError;
use crate::operation::{
    AddColumn, AlterColumn, CreateIndex, CreateTable, DropColumn, DropIndex, DropTable, Operation,
};
use crate::schema::{SchemaSnapshot, TableSchema};

/// Computes the operations that turn `old` into `new`.
///
/// New tables come first (each followed by its indexes), then changes to
/// tables present in both, then dropped tables. Tables are created after
/// the tables their foreign keys reference and dropped before them. Within
/// a table, indexes are dropped before column changes and created after
/// them. Columns follow the declaration order of `new`, dropped columns the
/// order of `old`.
///
/// Primary key, unique and foreign key changes on an existing column have
/// no structural operation and are rejected with
/// [`MigrationError::UnsupportedChange`].
pub fn diff(old: &SchemaSnapshot, new: &SchemaSnapshot) -> Result<Vec<Operation>, MigrationError> {
    let mut ops = Vec::new();

    let created: BTreeMap<&str, &TableSchema> = new
        .tables
        .iter()
        .filter(|(name, _)| old.table(name).is_none())
        .map(|(name, table)| (name.as_str(), table))
        .collect();
    for name in reference_order(&created) {
        let table = created[name];
        ops.push(
            CreateTable {
                name: name.to_string(),
                columns: table.columns.clone(),
            }
            .into(),
        );
        for index in table.indexes.values() {
            ops.push(CreateIndex::new(name, index.clone()).into());
        }
    }

    for (name, table) in &new.tables {
        if let Some(previous) = old.table(name) {
            diff_table(name, previous, table, &mut ops)?;
        }
    }

    let dropped: BTreeMap<&str, &TableSchema> = old
        .tables
        .iter()
        .filter(|(name, _)| !new.tables.contains_key(*name))
        .map(|(name, table)| (name.as_str(), table))
        .collect();
    for name in reference_order(&dropped).into_iter().rev() {
        ops.push(DropTable::new(name).into());
    }

    Ok(ops)
}

/// Table names with every table after the tables it references, name order
/// otherwise. References outside `tables` and self references are ignored;
/// tables caught in a reference cycle go last, in name order.
fn reference_order<'t>(tables: &BTreeMap<&'t str, &TableSchema>) -> Vec<&'t str> {
    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut order = Vec::with_capacity(tables.len());

    while order.len() < tables.len() {
        let next = tables.iter().find(|&(&name, table)| {
            !placed.contains(name)
                && table
                    .columns
                    .iter()
                    .filter_map(|column| column.references.as_ref())
                    .map(|fk| fk.table.as_str())
                    .all(|target| {
                        target == name || !tables.contains_key(target) || placed.contains(target)
                    })
        });
        match next {
            Some((&name, _)) => {
                placed.insert(name);
                order.push(name);
            }
            None => {
                order.extend(tables.keys().copied().filter(|name| !placed.contains(*name)));
                break;
            }
        }
    }
    order
}

fn diff_table(
    name: &str,
    old: &TableSchema,
    new: &TableSchema,
    ops: &mut Vec<Operation>,
) -> Result<(), MigrationError> {
    for (index_name, index) in &old.indexes {
        if new.indexes.get(index_name) != Some(index) {
            ops.push(
                DropIndex::new(name, index_name.clone())
                    .with_definition(index.clone())
                    .into(),
            );
        }
    }

    for column in &new.columns {
        match old.column(&column.name) {
            None => ops.push(AddColumn::new(name, column.clone()).into()),
            Some(existing) if existing == column => {}
            Some(existing) => {
                if !existing.alterable_to(column) {
                    return Err(MigrationError::UnsupportedChange {
                        table: name.to_string(),
                        column: column.name.clone(),
                        reason: "primary key, unique and foreign key changes need a raw migration"
                            .to_string(),
                    });
                }
                ops.push(
                    AlterColumn::new(name, column.clone())
                        .from_previous(existing.clone())
                        .into(),
                );
            }
        }
    }

    for column in &old.columns {
        if new.column(&column.name).is_none() {
            ops.push(DropColumn::new(name, column.name.clone()).into());
        }
    }

    for (index_name, index) in &new.indexes {
        if old.indexes.get(index_name) != Some(index) {
            ops.push(CreateIndex::new(name, index.clone()).into());
        }
    }

    Ok(())
}
