use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::selector::StrategyPreference;

const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";
const DEFAULT_SNAPSHOT_TABLE: &str = "schema_snapshot";
const DEFAULT_LOCK_NAME: &str = "schemaflow";

/// What to do when another process holds the migration lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum LockMode {
    #[default]
    FailFast,
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    pub lock_mode: LockMode,
    pub lock_name: String,
    pub ledger_table: String,
    pub snapshot_table: String,
    pub default_strategy: StrategyPreference,
    /// How long a SQLite connection waits on a locked database file.
    pub busy_timeout: Duration,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::default(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            snapshot_table: DEFAULT_SNAPSHOT_TABLE.to_string(),
            default_strategy: StrategyPreference::default(),
            busy_timeout: Duration::from_secs(30),
        }
    }
}

impl MigratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn with_lock_wait(self, timeout: Duration, poll_interval: Duration) -> Self {
        self.with_lock_mode(LockMode::Wait {
            timeout,
            poll_interval,
        })
    }

    pub fn with_lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = name.into();
        self
    }

    pub fn with_ledger_table(mut self, name: impl Into<String>) -> Self {
        self.ledger_table = name.into();
        self
    }

    pub fn with_snapshot_table(mut self, name: impl Into<String>) -> Self {
        self.snapshot_table = name.into();
        self
    }

    pub fn with_default_strategy(mut self, preference: StrategyPreference) -> Self {
        self.default_strategy = preference;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Table names end up spliced into SQL, so they must be plain identifiers.
    pub fn validate(&self) -> Result<(), MigrationError> {
        for (what, name) in [
            ("ledger_table", &self.ledger_table),
            ("snapshot_table", &self.snapshot_table),
        ] {
            if !is_identifier(name) {
                return Err(MigrationError::Configuration(format!(
                    "{} must be a plain SQL identifier, got {:?}",
                    what, name
                )));
            }
        }
        if self.ledger_table == self.snapshot_table {
            return Err(MigrationError::Configuration(
                "ledger_table and snapshot_table must differ".to_string(),
            ));
        }
        if self.lock_name.is_empty() {
            return Err(MigrationError::Configuration(
                "lock_name must not be empty".to_string(),
            ));
        }
        if let LockMode::Wait { poll_interval, .. } = self.lock_mode {
            if poll_interval.is_zero() {
                return Err(MigrationError::Configuration(
                    "lock poll interval must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
