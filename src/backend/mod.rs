mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use sea_query::{
    Alias, ColumnDef, ForeignKey as SeaForeignKey, ForeignKeyAction, Index as SeaIndex,
    IndexCreateStatement, IndexDropStatement, Table, TableAlterStatement, TableCreateStatement,
    TableDropStatement,
};

use crate::field::{Field, FieldType, ReferentialAction};
use crate::operation::{Index, IndexOrder};

/// SQL dialect used to render operations.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports_alter_column(&self) -> bool;
    fn supports_transactional_ddl(&self) -> bool;

    fn build_table_create(&self, stmt: TableCreateStatement) -> String;
    fn build_table_drop(&self, stmt: TableDropStatement) -> String;
    fn build_table_alter(&self, stmt: TableAlterStatement) -> String;
    fn build_index_create(&self, stmt: IndexCreateStatement) -> String;
    fn build_index_drop(&self, stmt: IndexDropStatement) -> String;

    fn quote_identifier(&self, name: &str) -> String;

    fn create_table_sql(&self, name: &str, columns: &[Field]) -> String {
        let mut stmt = Table::create();
        stmt.table(Alias::new(name));

        for column in columns {
            stmt.col(column_def(column));
        }

        for column in columns {
            if let Some(ref fk) = column.references {
                stmt.foreign_key(
                    SeaForeignKey::create()
                        .from_col(Alias::new(&column.name))
                        .to_tbl(Alias::new(&fk.table))
                        .to_col(Alias::new(&fk.column))
                        .on_delete(referential_action_to_sea(&fk.on_delete))
                        .on_update(referential_action_to_sea(&fk.on_update)),
                );
            }
        }

        self.build_table_create(stmt)
    }

    fn drop_table_sql(&self, name: &str) -> String {
        let stmt = Table::drop().table(Alias::new(name)).to_owned();
        self.build_table_drop(stmt)
    }

    fn add_column_sql(&self, table: &str, column: &Field) -> String {
        let stmt = Table::alter()
            .table(Alias::new(table))
            .add_column(column_def(column))
            .to_owned();
        self.build_table_alter(stmt)
    }

    fn drop_column_sql(&self, table: &str, column: &str) -> String {
        let stmt = Table::alter()
            .table(Alias::new(table))
            .drop_column(Alias::new(column))
            .to_owned();
        self.build_table_alter(stmt)
    }

    /// Statements that turn the column into `column`. `None` when the
    /// dialect cannot alter a column in place.
    fn alter_column_sql(
        &self,
        table: &str,
        column: &Field,
        previous: Option<&Field>,
    ) -> Option<Vec<String>> {
        if !self.supports_alter_column() {
            return None;
        }

        let mut col = ColumnDef::new(Alias::new(&column.name));
        apply_column_type(&mut col, &column.field_type);

        if column.nullable {
            col.null();
        } else {
            col.not_null();
        }

        if let Some(ref default) = column.default {
            col.default(sea_query::Expr::cust(default));
        }

        let stmt = Table::alter()
            .table(Alias::new(table))
            .modify_column(col)
            .to_owned();
        let mut sqls = vec![self.build_table_alter(stmt)];

        let had_default = previous.is_some_and(|p| p.default.is_some());
        if column.default.is_none() && had_default {
            sqls.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                self.quote_identifier(table),
                self.quote_identifier(&column.name)
            ));
        }

        Some(sqls)
    }

    fn create_index_sql(&self, table: &str, index: &Index) -> String {
        let mut stmt = SeaIndex::create();
        stmt.name(&index.name).table(Alias::new(table));

        if index.unique {
            stmt.unique();
        }

        for (col_name, order) in &index.columns {
            match order {
                IndexOrder::Asc => stmt.col(Alias::new(col_name)),
                IndexOrder::Desc => stmt.col((Alias::new(col_name), sea_query::IndexOrder::Desc)),
            };
        }

        self.build_index_create(stmt.to_owned())
    }

    fn drop_index_sql(&self, table: &str, index_name: &str) -> String {
        let stmt = SeaIndex::drop()
            .name(index_name)
            .table(Alias::new(table))
            .to_owned();
        self.build_index_drop(stmt)
    }
}

fn column_def(field: &Field) -> ColumnDef {
    let mut col = ColumnDef::new(Alias::new(&field.name));

    apply_column_type(&mut col, &field.field_type);

    if field.primary_key {
        col.primary_key();
        if matches!(field.field_type, FieldType::Serial | FieldType::BigSerial) {
            col.auto_increment();
        }
    }

    if !field.nullable && !field.primary_key {
        col.not_null();
    }

    if field.unique && !field.primary_key {
        col.unique_key();
    }

    if let Some(ref default) = field.default {
        col.default(sea_query::Expr::cust(default));
    }

    col
}

fn apply_column_type(col: &mut ColumnDef, field_type: &FieldType) {
    match field_type {
        FieldType::Serial | FieldType::Integer => {
            col.integer();
        }
        FieldType::BigSerial | FieldType::BigInt => {
            col.big_integer();
        }
        FieldType::SmallInt => {
            col.small_integer();
        }
        FieldType::Text => {
            col.text();
        }
        FieldType::VarChar(len) => {
            col.string_len(*len as u32);
        }
        FieldType::Boolean => {
            col.boolean();
        }
        FieldType::Timestamp => {
            col.timestamp();
        }
        FieldType::TimestampTz => {
            col.timestamp_with_time_zone();
        }
        FieldType::Date => {
            col.date();
        }
        FieldType::Time => {
            col.time();
        }
        FieldType::Uuid => {
            col.uuid();
        }
        FieldType::Json => {
            col.json();
        }
        FieldType::JsonB => {
            col.json_binary();
        }
        FieldType::Binary => {
            col.binary();
        }
        FieldType::Real => {
            col.float();
        }
        FieldType::DoublePrecision => {
            col.double();
        }
        FieldType::Decimal { precision, scale } => {
            col.decimal_len(*precision as u32, *scale as u32);
        }
    }
}

fn referential_action_to_sea(action: &ReferentialAction) -> ForeignKeyAction {
    match action {
        ReferentialAction::NoAction => ForeignKeyAction::NoAction,
        ReferentialAction::Restrict => ForeignKeyAction::Restrict,
        ReferentialAction::Cascade => ForeignKeyAction::Cascade,
        ReferentialAction::SetNull => ForeignKeyAction::SetNull,
        ReferentialAction::SetDefault => ForeignKeyAction::SetDefault,
    }
}
