use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::migration::Strategy;
use crate::operation::Operation;
use crate::schema::SchemaSnapshot;

/// Strategy asked for by a caller or configured as the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    #[default]
    Auto,
    Raw,
    FromModel,
}

/// Everything a caller hands over when asking for a new migration.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub name: String,
    pub preference: Option<StrategyPreference>,
    pub up: Option<Vec<Operation>>,
    /// `None` derives the down list from the up operations.
    pub down: Option<Vec<Operation>>,
    pub model: Option<SchemaSnapshot>,
}

impl GenerationRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn prefer(mut self, preference: StrategyPreference) -> Self {
        self.preference = Some(preference);
        self
    }

    pub fn raw(mut self, up: Vec<Operation>, down: Option<Vec<Operation>>) -> Self {
        self.up = Some(up);
        self.down = down;
        self
    }

    pub fn from_model(mut self, model: SchemaSnapshot) -> Self {
        self.model = Some(model);
        self
    }
}

/// Picks the authoring strategy for `request`. An explicit preference on
/// the request wins over `default`. Never inspects or builds operations.
pub fn select(
    request: &GenerationRequest,
    default: StrategyPreference,
) -> Result<Strategy, MigrationError> {
    match request.preference.unwrap_or(default) {
        StrategyPreference::Raw => Ok(Strategy::RawScript),
        StrategyPreference::FromModel if request.model.is_some() => Ok(Strategy::ModelDiff),
        StrategyPreference::FromModel => Err(MigrationError::Configuration(
            "model-diff generation needs a model schema description".to_string(),
        )),
        StrategyPreference::Auto if request.up.is_some() => Ok(Strategy::RawScript),
        StrategyPreference::Auto if request.model.is_some() => Ok(Strategy::ModelDiff),
        StrategyPreference::Auto => Err(MigrationError::Configuration(
            "neither hand-written operations nor a model schema were supplied".to_string(),
        )),
    }
}
