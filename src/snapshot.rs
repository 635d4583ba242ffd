use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::schema::SchemaSnapshot;

/// Holds the single current schema snapshot.
pub trait SnapshotStore {
    /// The empty snapshot when nothing has been saved yet.
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError>;

    /// Replaces the current snapshot as a whole.
    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySnapshotStore {
    current: SchemaSnapshot,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: SchemaSnapshot) -> Self {
        Self { current: snapshot }
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        Ok(self.current.clone())
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        self.current = snapshot.clone();
        Ok(())
    }
}

/// Snapshot kept as a JSON file, replaced through a sibling temp file and
/// a rename so readers never see a half-written snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SchemaSnapshot::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        write_atomically(&self.path, &serde_json::to_vec_pretty(snapshot)?)
    }
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for &mut S {
    fn load(&mut self) -> Result<SchemaSnapshot, StoreError> {
        (**self).load()
    }

    fn save(&mut self, snapshot: &SchemaSnapshot) -> Result<(), StoreError> {
        (**self).save(snapshot)
    }
}

pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}
