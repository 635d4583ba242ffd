use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::config::MigratorConfig;
use crate::definition::DefinitionStore;
use crate::error::{MigrationError, Result, StoreError};
use crate::ledger::LedgerEntry;
use crate::migration::MigrationId;
use crate::migrator::{BatchReport, ChecksumStatus, DownTarget, Migrator, StatusReport, UpTarget};
use crate::operation::Operation;
use crate::schema::SchemaSnapshot;
use crate::selector::{GenerationRequest, StrategyPreference};
use crate::store::Store;

/// The `migrate` command surface, independent of how arguments are parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateCommand {
    /// Generates and writes a new definition without applying it.
    Create {
        name: String,
        preference: Option<StrategyPreference>,
        /// JSON array of up operations.
        up: Option<PathBuf>,
        /// JSON array of down operations.
        down: Option<PathBuf>,
        /// JSON schema snapshot describing the declared model.
        model: Option<PathBuf>,
    },
    Up {
        to: Option<MigrationId>,
    },
    Down {
        target: DownTarget,
    },
    Status,
    History,
}

/// Runs `command` and returns the text to show the operator.
pub fn run<S: Store>(
    command: MigrateCommand,
    definitions: &DefinitionStore,
    store: S,
    config: MigratorConfig,
) -> Result<String> {
    let registry = definitions.load_all()?;
    let mut migrator = Migrator::new(&registry, store).with_config(config);

    match command {
        MigrateCommand::Create {
            name,
            preference,
            up,
            down,
            model,
        } => {
            let mut request = GenerationRequest::new(name);
            if let Some(preference) = preference {
                request = request.prefer(preference);
            }
            if up.is_some() || down.is_some() {
                let up = up.as_deref().map(read_json::<Vec<Operation>>).transpose()?;
                let down = down.as_deref().map(read_json::<Vec<Operation>>).transpose()?;
                request = request.raw(up.unwrap_or_default(), down);
            } else if preference == Some(StrategyPreference::Raw) {
                request = request.raw(Vec::new(), None);
            }
            if let Some(model) = model {
                request = request.from_model(read_json::<SchemaSnapshot>(&model)?);
            }

            let migration = migrator.generate(request, Utc::now())?;
            let path = definitions.write(&migration)?;
            Ok(format!(
                "Created {} ({}, {} operation(s){}) at {}\n",
                migration.label(),
                migration.strategy(),
                migration.up_operations().len(),
                if migration.is_irreversible() {
                    ", irreversible"
                } else {
                    ""
                },
                path.display()
            ))
        }
        MigrateCommand::Up { to } => {
            let target = to.map_or(UpTarget::Latest, UpTarget::To);
            let report = migrator.up(target)?;
            Ok(render_report(&report, "Applied"))
        }
        MigrateCommand::Down { target } => {
            let report = migrator.down(target)?;
            Ok(render_report(&report, "Reverted"))
        }
        MigrateCommand::Status => Ok(render_status(&migrator.status()?)),
        MigrateCommand::History => Ok(render_history(&migrator.history()?)),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(StoreError::from)?;
    Ok(serde_json::from_slice(&bytes).map_err(StoreError::from)?)
}

pub fn render_report(report: &BatchReport, verb: &str) -> String {
    let mut out = String::new();
    if report.is_empty() && !report.cancelled {
        out.push_str("Nothing to do\n");
        return out;
    }

    for outcome in &report.outcomes {
        let _ = writeln!(
            out,
            "{} {}_{} ({} ms)",
            verb,
            outcome.id,
            outcome.name,
            outcome.duration.as_millis()
        );
    }
    if let Some(batch) = report.batch {
        let _ = writeln!(out, "Batch {}", batch);
    }
    if report.cancelled {
        out.push_str("Cancelled before the remaining migrations\n");
    }
    out
}

pub fn render_status(status: &StatusReport) -> String {
    let mut out = String::new();
    for row in &status.rows {
        let state = match &row.checksum {
            ChecksumStatus::Verified => {
                format!("applied (batch {})", row.batch.unwrap_or_default())
            }
            ChecksumStatus::Mismatch { recorded, current } => format!(
                "applied, CHECKSUM MISMATCH (recorded {}, now {})",
                short(recorded),
                short(current)
            ),
            ChecksumStatus::NotApplied => "pending".to_string(),
        };
        let _ = writeln!(
            out,
            "{}_{} [{}{}] {}",
            row.id,
            row.name,
            row.strategy,
            if row.irreversible { ", irreversible" } else { "" },
            state
        );
    }
    for entry in &status.unknown {
        let _ = writeln!(
            out,
            "{}_{} applied in batch {} but has no definition",
            entry.migration_id, entry.name, entry.batch
        );
    }
    if out.is_empty() {
        out.push_str("No migrations\n");
    }
    out
}

pub fn render_history(entries: &[LedgerEntry]) -> String {
    if entries.is_empty() {
        return "No migrations applied\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(
            out,
            "{}  batch {:>3}  {}_{} [{}] {}",
            entry.applied_at.to_rfc3339(),
            entry.batch,
            entry.migration_id,
            entry.name,
            entry.strategy,
            short(&entry.checksum)
        );
    }
    out
}

/// One-line operator message carrying the error category.
pub fn render_error(error: &MigrationError) -> String {
    format!("error[{}]: {}", error.category(), error)
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}
