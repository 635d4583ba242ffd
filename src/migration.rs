use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::Backend;
use crate::error::{MigrationError, Result, StoreError};
use crate::operation::Operation;

/// Globally ordered migration id: `YYYYMMDDHHMMSS * 1000 + sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(u64);

impl MigrationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id for `sequence` within the second of `at`.
    pub fn from_timestamp(at: DateTime<Utc>, sequence: u16) -> Self {
        let stamp = u64::from(at.year().unsigned_abs()) * 10_000_000_000
            + u64::from(at.month()) * 100_000_000
            + u64::from(at.day()) * 1_000_000
            + u64::from(at.hour()) * 10_000
            + u64::from(at.minute()) * 100
            + u64::from(at.second());
        Self(stamp * 1000 + u64::from(sequence.min(999)))
    }

    /// Next id after `last`, never going backwards even when the clock does.
    pub fn generate(at: DateTime<Utc>, last: Option<MigrationId>) -> Self {
        let candidate = Self::from_timestamp(at, 0);
        match last {
            Some(last) if last >= candidate => Self(last.0 + 1),
            _ => candidate,
        }
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MigrationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// How a migration was authored. Recorded once and never re-decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RawScript,
    ModelDiff,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RawScript => "raw_script",
            Strategy::ModelDiff => "model_diff",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw_script" => Ok(Strategy::RawScript),
            "model_diff" => Ok(Strategy::ModelDiff),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// An immutable, checksummed unit of schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    id: MigrationId,
    name: String,
    strategy: Strategy,
    checksum: String,
    up: Vec<Operation>,
    down: Vec<Operation>,
    irreversible: bool,
    depends_on: BTreeSet<MigrationId>,
}

impl Migration {
    pub fn raw(id: MigrationId, name: impl Into<String>) -> MigrationBuilder {
        MigrationBuilder::new(id, name.into(), Strategy::RawScript)
    }

    pub fn model_diff(id: MigrationId, name: impl Into<String>) -> MigrationBuilder {
        MigrationBuilder::new(id, name.into(), Strategy::ModelDiff)
    }

    pub fn builder(
        id: MigrationId,
        name: impl Into<String>,
        strategy: Strategy,
    ) -> MigrationBuilder {
        MigrationBuilder::new(id, name.into(), strategy)
    }

    pub fn id(&self) -> MigrationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn up_operations(&self) -> &[Operation] {
        &self.up
    }

    pub fn down_operations(&self) -> &[Operation] {
        &self.down
    }

    pub fn is_irreversible(&self) -> bool {
        self.irreversible
    }

    pub fn depends_on(&self) -> &BTreeSet<MigrationId> {
        &self.depends_on
    }

    /// `<id>_<name>`, the form used in file names and log lines.
    pub fn label(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }

    /// Tables touched by the up operations. Raw statements contribute none.
    pub fn tables(&self) -> BTreeSet<&str> {
        self.up.iter().filter_map(|op| op.table()).collect()
    }

    pub fn up_sql(&self, backend: &dyn Backend) -> Result<Vec<String>> {
        operations_sql(&self.up, backend)
    }

    /// `None` for irreversible migrations.
    pub fn down_sql(&self, backend: &dyn Backend) -> Result<Option<Vec<String>>> {
        if self.irreversible {
            return Ok(None);
        }
        operations_sql(&self.down, backend).map(Some)
    }
}

fn operations_sql(ops: &[Operation], backend: &dyn Backend) -> Result<Vec<String>> {
    let mut sqls = Vec::new();
    for op in ops {
        sqls.extend(op.to_sql(backend)?);
    }
    Ok(sqls)
}

/// Lowercase hex SHA-256 of the canonical JSON of the operation lists and
/// the irreversible marker.
pub fn checksum(up: &[Operation], down: &[Operation], irreversible: bool) -> Result<String> {
    let canonical =
        serde_json::to_vec(&(up, down, irreversible)).map_err(StoreError::from)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct MigrationBuilder {
    id: MigrationId,
    name: String,
    strategy: Strategy,
    up: Vec<Operation>,
    down: Option<Vec<Operation>>,
    irreversible: bool,
    depends_on: BTreeSet<MigrationId>,
}

impl MigrationBuilder {
    fn new(id: MigrationId, name: String, strategy: Strategy) -> Self {
        Self {
            id,
            name,
            strategy,
            up: Vec::new(),
            down: None,
            irreversible: false,
            depends_on: BTreeSet::new(),
        }
    }

    /// Append an up operation. Unless [`down`](Self::down) is called, the
    /// down list is derived from the inverses of the up operations.
    pub fn operation(mut self, op: impl Into<Operation>) -> Self {
        self.up.push(op.into());
        self
    }

    pub fn up(mut self, ops: Vec<Operation>) -> Self {
        self.up = ops;
        self
    }

    /// Explicit down operations, run in the given order on rollback.
    pub fn down(mut self, ops: Vec<Operation>) -> Self {
        self.down = Some(ops);
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = MigrationId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    pub fn build(self) -> Result<Migration> {
        let invalid = |reason: &str| MigrationError::InvalidMigration {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(
                "name must be non-empty and use only letters, digits, '_' or '-'",
            ));
        }
        if self.depends_on.contains(&self.id) {
            return Err(invalid("a migration cannot depend on itself"));
        }
        if self.strategy == Strategy::ModelDiff && self.up.iter().any(Operation::is_raw) {
            return Err(invalid("raw statements are only allowed in raw script migrations"));
        }

        let (down, irreversible) = match self.down {
            Some(down) => {
                if self.irreversible && !down.is_empty() {
                    return Err(invalid("an irreversible migration cannot have down operations"));
                }
                let irreversible = self.irreversible || (down.is_empty() && !self.up.is_empty());
                (down, irreversible)
            }
            None if self.irreversible => (Vec::new(), true),
            None => match invert_all(&self.up) {
                Some(down) => (down, false),
                None => (Vec::new(), true),
            },
        };

        let checksum = checksum(&self.up, &down, irreversible)?;

        Ok(Migration {
            id: self.id,
            name: self.name,
            strategy: self.strategy,
            checksum,
            up: self.up,
            down,
            irreversible,
            depends_on: self.depends_on,
        })
    }
}

/// Structural inverses of `ops` in reverse order, or `None` when any
/// operation has no inverse.
pub fn invert_all(ops: &[Operation]) -> Option<Vec<Operation>> {
    ops.iter().rev().map(Operation::invert).collect()
}

/// All known migrations, keyed and iterated by id.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<MigrationId, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, migration: Migration) -> Result<()> {
        if let Some(existing) = self.migrations.get(&migration.id) {
            return Err(MigrationError::InvalidMigration {
                name: migration.name.clone(),
                reason: format!("id {} is already used by {}", migration.id, existing.name),
            });
        }
        self.migrations.insert(migration.id, migration);
        Ok(())
    }

    pub fn get(&self, id: MigrationId) -> Option<&Migration> {
        self.migrations.get(&id)
    }

    pub fn contains(&self, id: MigrationId) -> bool {
        self.migrations.contains_key(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    /// Highest known id.
    pub fn latest(&self) -> Option<MigrationId> {
        self.migrations.keys().next_back().copied()
    }

    /// Dependencies a new migration gets when none are given: the
    /// immediately preceding migration, whatever its strategy.
    pub fn default_dependencies(&self) -> BTreeSet<MigrationId> {
        self.latest().into_iter().collect()
    }

    pub fn next_id(&self, now: DateTime<Utc>) -> MigrationId {
        MigrationId::generate(now, self.latest())
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
