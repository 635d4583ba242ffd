use std::collections::BTreeSet;

use crate::error::MigrationError;
use crate::migration::{Migration, MigrationId, Strategy};
use crate::operation::Operation;
use crate::schema::{self, SchemaSnapshot};
use crate::selector::GenerationRequest;

/// Inputs shared by both sources when producing a migration.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub id: MigrationId,
    pub name: String,
    pub depends_on: BTreeSet<MigrationId>,
    /// Schema the new migration starts from.
    pub baseline: SchemaSnapshot,
}

/// Operator-authored operations, packaged verbatim.
#[derive(Debug, Clone, Default)]
pub struct RawScriptSource {
    pub up: Vec<Operation>,
    /// Derived from the up operations when `None`.
    pub down: Option<Vec<Operation>>,
}

impl RawScriptSource {
    pub fn generate(&self, ctx: &GenerationContext) -> Result<Migration, MigrationError> {
        let mut builder = Migration::raw(ctx.id, ctx.name.clone())
            .up(self.up.clone())
            .depends_on(ctx.depends_on.iter().copied());
        if let Some(ref down) = self.down {
            builder = builder.down(down.clone());
        }
        let migration = builder.build()?;

        // structural errors surface at creation time
        ctx.baseline.apply_all(migration.up_operations())?;

        Ok(migration)
    }
}

/// Operations computed by diffing a declared model against the baseline.
#[derive(Debug, Clone, Default)]
pub struct ModelDiffSource {
    pub model: SchemaSnapshot,
}

impl ModelDiffSource {
    pub fn generate(&self, ctx: &GenerationContext) -> Result<Migration, MigrationError> {
        let up = schema::diff(&ctx.baseline, &self.model)?;
        if up.is_empty() {
            return Err(MigrationError::NoChanges);
        }

        Migration::model_diff(ctx.id, ctx.name.clone())
            .up(up)
            .depends_on(ctx.depends_on.iter().copied())
            .build()
    }
}

#[derive(Debug, Clone)]
pub enum MigrationSource {
    RawScript(RawScriptSource),
    ModelDiff(ModelDiffSource),
}

impl MigrationSource {
    /// Builds the source for an already selected strategy.
    pub fn for_strategy(
        strategy: Strategy,
        request: GenerationRequest,
    ) -> Result<Self, MigrationError> {
        match strategy {
            Strategy::RawScript => Ok(MigrationSource::RawScript(RawScriptSource {
                up: request.up.unwrap_or_default(),
                down: request.down,
            })),
            Strategy::ModelDiff => request
                .model
                .map(|model| MigrationSource::ModelDiff(ModelDiffSource { model }))
                .ok_or_else(|| {
                    MigrationError::Configuration(
                        "model-diff generation needs a model schema description".to_string(),
                    )
                }),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            MigrationSource::RawScript(_) => Strategy::RawScript,
            MigrationSource::ModelDiff(_) => Strategy::ModelDiff,
        }
    }

    pub fn generate(&self, ctx: &GenerationContext) -> Result<Migration, MigrationError> {
        match self {
            MigrationSource::RawScript(source) => source.generate(ctx),
            MigrationSource::ModelDiff(source) => source.generate(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use crate::field::{Field, FieldType};
    use crate::operation::{CreateTable, DropTable, RawStatement};
    use crate::schema::TableSchema;

    fn ctx(baseline: SchemaSnapshot) -> GenerationContext {
        GenerationContext {
            id: MigrationId::new(20240101000000000),
            name: "change".to_string(),
            depends_on: BTreeSet::from([MigrationId::new(20231231000000000)]),
            baseline,
        }
    }

    fn users_table() -> CreateTable {
        CreateTable::new("users")
            .add_column(Field::new("id", FieldType::Serial).primary_key())
            .add_column(Field::new("email", FieldType::Text).not_null())
    }

    #[test]
    fn raw_script_keeps_operations_verbatim() {
        let source = RawScriptSource {
            up: vec![users_table().into()],
            down: Some(vec![DropTable::new("users").into()]),
        };

        let migration = source.generate(&ctx(SchemaSnapshot::new())).unwrap();

        assert_eq!(migration.strategy(), Strategy::RawScript);
        assert_eq!(migration.up_operations(), &[Operation::from(users_table())]);
        assert_eq!(
            migration.down_operations(),
            &[Operation::from(DropTable::new("users"))]
        );
        assert_eq!(
            migration.depends_on(),
            &BTreeSet::from([MigrationId::new(20231231000000000)])
        );
    }

    #[test]
    fn raw_script_rejects_structurally_invalid_operations() {
        let source = RawScriptSource {
            up: vec![DropTable::new("ghost").into()],
            down: None,
        };

        let err = source.generate(&ctx(SchemaSnapshot::new())).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Schema(SchemaError::UnknownTable(_))
        ));
    }

    #[test]
    fn model_diff_of_new_table_is_create_table() {
        let model = SchemaSnapshot::new().with_table(
            "orders",
            TableSchema::new(vec![
                Field::new("id", FieldType::Serial).primary_key(),
                Field::new("total", FieldType::Integer).not_null(),
            ]),
        );
        let source = ModelDiffSource {
            model: model.clone(),
        };

        let migration = source.generate(&ctx(SchemaSnapshot::new())).unwrap();

        assert_eq!(migration.strategy(), Strategy::ModelDiff);
        assert_eq!(migration.up_operations().len(), 1);
        assert!(matches!(
            migration.up_operations()[0],
            Operation::CreateTable(ref op) if op.name == "orders"
        ));
        assert_eq!(
            migration.down_operations(),
            &[Operation::from(DropTable::new("orders"))]
        );
        assert!(!migration.is_irreversible());
    }

    #[test]
    fn model_diff_dropping_a_table_is_irreversible() {
        let baseline = SchemaSnapshot::new().with_table("legacy", TableSchema::default());
        let source = ModelDiffSource {
            model: SchemaSnapshot::new(),
        };

        let migration = source.generate(&ctx(baseline)).unwrap();

        assert!(migration.is_irreversible());
        assert!(migration.down_operations().is_empty());
    }

    #[test]
    fn model_diff_without_changes_fails() {
        let schema = SchemaSnapshot::new().with_table("users", TableSchema::default());
        let source = ModelDiffSource {
            model: schema.clone(),
        };

        assert!(matches!(
            source.generate(&ctx(schema)),
            Err(MigrationError::NoChanges)
        ));
    }

    #[test]
    fn for_strategy_builds_matching_source() {
        let request = GenerationRequest::new("x")
            .raw(vec![RawStatement::new("SELECT 1").into()], Some(vec![]));
        let source = MigrationSource::for_strategy(Strategy::RawScript, request).unwrap();
        assert_eq!(source.strategy(), Strategy::RawScript);

        let err = MigrationSource::for_strategy(Strategy::ModelDiff, GenerationRequest::new("y"))
            .unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(_)));
    }
}
