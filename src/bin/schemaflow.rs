use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

use schemaflow::command::{self, MigrateCommand};
use schemaflow::config::MigratorConfig;
use schemaflow::definition::DefinitionStore;
use schemaflow::error::MigrationError;
use schemaflow::migration::MigrationId;
use schemaflow::migrator::DownTarget;
use schemaflow::selector::StrategyPreference;
use schemaflow::store::SqliteStore;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "schemaflow")]
#[command(about = "Versioned schema migrations for SQLite databases")]
struct Cli {
    /// SQLite database file to migrate
    #[arg(long, env = "SCHEMAFLOW_DATABASE", default_value = "schemaflow.db", global = true)]
    database: PathBuf,

    /// Directory holding migration definitions
    #[arg(long, env = "SCHEMAFLOW_MIGRATIONS_DIR", default_value = "migrations", global = true)]
    migrations_dir: PathBuf,

    /// JSON file with migrator settings; flags below override it
    #[arg(long, env = "SCHEMAFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Wait up to this many seconds for the migration lock instead of failing
    #[arg(long, env = "SCHEMAFLOW_LOCK_WAIT", global = true)]
    lock_wait: Option<u64>,

    /// Table that records applied migrations
    #[arg(long, env = "SCHEMAFLOW_LEDGER_TABLE", global = true)]
    ledger_table: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schema migrations
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Generate a new migration definition without applying it
    Create {
        /// Migration name (letters, digits, '_' or '-')
        name: String,

        /// Hand-written migration
        #[arg(long, conflicts_with = "from_model")]
        raw: bool,

        /// JSON file with the up operations
        #[arg(long, requires = "raw")]
        up: Option<PathBuf>,

        /// JSON file with the down operations
        #[arg(long, requires = "raw")]
        down: Option<PathBuf>,

        /// JSON schema description to diff against the current schema
        #[arg(long)]
        from_model: Option<PathBuf>,
    },

    /// Apply pending migrations
    Up {
        /// Stop after this migration id
        #[arg(long)]
        to: Option<MigrationId>,
    },

    /// Revert applied migrations (one step by default)
    Down {
        /// Revert everything applied after this migration id
        #[arg(long, conflicts_with_all = ["steps", "batch"])]
        to: Option<MigrationId>,

        /// Revert this many migrations
        #[arg(long, conflicts_with = "batch")]
        steps: Option<usize>,

        /// Revert the most recent batch
        #[arg(long)]
        batch: bool,
    },

    /// Show pending and applied migrations with checksum verification
    Status,

    /// Show applied migrations with batch numbers and timestamps
    History,
}

impl From<MigrateCommands> for MigrateCommand {
    fn from(command: MigrateCommands) -> Self {
        match command {
            MigrateCommands::Create {
                name,
                raw,
                up,
                down,
                from_model,
            } => MigrateCommand::Create {
                name,
                preference: if raw {
                    Some(StrategyPreference::Raw)
                } else if from_model.is_some() {
                    Some(StrategyPreference::FromModel)
                } else {
                    None
                },
                up,
                down,
                model: from_model,
            },
            MigrateCommands::Up { to } => MigrateCommand::Up { to },
            MigrateCommands::Down { to, steps, batch } => {
                let target = match (to, steps, batch) {
                    (Some(id), _, _) => DownTarget::To(id),
                    (_, _, true) => DownTarget::LastBatch,
                    (_, Some(steps), _) => DownTarget::Steps(steps),
                    (None, None, false) => DownTarget::Steps(1),
                };
                MigrateCommand::Down { target }
            }
            MigrateCommands::Status => MigrateCommand::Status,
            MigrateCommands::History => MigrateCommand::History,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<MigratorConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let body = fs::read(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_slice(&body)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => MigratorConfig::default(),
    };

    if let Some(seconds) = cli.lock_wait {
        config = config.with_lock_wait(Duration::from_secs(seconds), LOCK_POLL_INTERVAL);
    }
    if let Some(table) = &cli.ledger_table {
        config = config.with_ledger_table(table.clone());
    }
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<String> {
    let config = load_config(&cli)?;
    let conn = Connection::open(&cli.database)
        .with_context(|| format!("opening database {}", cli.database.display()))?;
    let store = SqliteStore::with_config(&conn, &config)?;
    let definitions = DefinitionStore::new(&cli.migrations_dir);

    let Commands::Migrate { migrate_command } = cli.command;
    let output = command::run(migrate_command.into(), &definitions, store, config)?;
    Ok(output)
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            match e.downcast_ref::<MigrationError>() {
                Some(error) => eprintln!("{}", command::render_error(error)),
                None => eprintln!("error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
