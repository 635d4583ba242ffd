use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MigrationError, Result, StoreError};
use crate::migration::{Migration, MigrationId, MigrationRegistry, Strategy};
use crate::operation::Operation;
use crate::snapshot::write_atomically;

/// On-disk form of a migration, one JSON file per migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionRecord {
    pub id: MigrationId,
    pub name: String,
    pub strategy: Strategy,
    pub checksum: String,
    #[serde(default)]
    pub irreversible: bool,
    pub up_operations: Vec<Operation>,
    #[serde(default)]
    pub down_operations: Vec<Operation>,
    #[serde(default)]
    pub depends_on: BTreeSet<MigrationId>,
}

impl From<&Migration> for DefinitionRecord {
    fn from(migration: &Migration) -> Self {
        Self {
            id: migration.id(),
            name: migration.name().to_string(),
            strategy: migration.strategy(),
            checksum: migration.checksum().to_string(),
            irreversible: migration.is_irreversible(),
            up_operations: migration.up_operations().to_vec(),
            down_operations: migration.down_operations().to_vec(),
            depends_on: migration.depends_on().clone(),
        }
    }
}

impl DefinitionRecord {
    /// Rebuilds the migration. The checksum is recomputed from content, never
    /// taken from the file.
    pub fn into_migration(self) -> Result<Migration> {
        let mut builder = Migration::builder(self.id, self.name, self.strategy)
            .up(self.up_operations)
            .down(self.down_operations)
            .depends_on(self.depends_on);
        if self.irreversible {
            builder = builder.irreversible();
        }
        builder.build()
    }
}

/// Directory of `<id>_<name>.json` migration definitions.
#[derive(Debug, Clone)]
pub struct DefinitionStore {
    dir: PathBuf,
}

impl DefinitionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, migration: &Migration) -> PathBuf {
        self.dir.join(format!("{}.json", migration.label()))
    }

    /// Writes a new definition. Existing files are never overwritten.
    pub fn write(&self, migration: &Migration) -> Result<PathBuf> {
        let path = self.path_for(migration);
        if path.exists() {
            return Err(MigrationError::InvalidMigration {
                name: migration.name().to_string(),
                reason: format!("{} already exists", path.display()),
            });
        }

        let record = DefinitionRecord::from(migration);
        let body = serde_json::to_vec_pretty(&record).map_err(StoreError::from)?;
        write_atomically(&path, &body)?;
        debug!(path = %path.display(), "wrote migration definition");
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<Migration> {
        let bytes = fs::read(path).map_err(StoreError::from)?;
        let record: DefinitionRecord = serde_json::from_slice(&bytes).map_err(StoreError::from)?;

        let file_id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.split('_').next())
            .and_then(|prefix| prefix.parse::<MigrationId>().ok());
        if file_id != Some(record.id) {
            return Err(MigrationError::InvalidMigration {
                name: record.name,
                reason: format!("file {} does not match id {}", path.display(), record.id),
            });
        }

        let stored = record.checksum.clone();
        let migration = record.into_migration()?;
        if migration.checksum() != stored {
            warn!(
                migration = %migration.id(),
                path = %path.display(),
                "definition was edited after it was generated"
            );
        }
        Ok(migration)
    }

    /// Every definition in the directory. A missing directory is empty.
    pub fn load_all(&self) -> Result<MigrationRegistry> {
        let mut registry = MigrationRegistry::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => return Err(StoreError::from(e).into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(StoreError::from)?.path();
            if path.extension().is_some_and(|ext| ext == "json") && is_definition_name(&path) {
                paths.push(path);
            } else {
                debug!(path = %path.display(), "skipping non-definition file");
            }
        }
        paths.sort();

        for path in paths {
            registry.register(self.load(&path)?)?;
        }
        debug!(count = registry.len(), dir = %self.dir.display(), "loaded migration definitions");
        Ok(registry)
    }
}

/// `<digits>_<name>.json`, the shape `path_for` produces.
fn is_definition_name(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return false;
    };
    match stem.split_once('_') {
        Some((id, name)) => {
            !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && !name.is_empty()
        }
        None => false,
    }
}
