//! Durable result cache: per-file mutant records and suite stats.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::coverage::SuiteStats;
use crate::mutant::{MutantStatus, Outcome};

/// Current persisted schema version. Bump only for additive changes; loads
/// stay tolerant in both directions.
pub const SCHEMA_VERSION: u32 = 1;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cached terminal state of one mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantRecord {
    /// Terminal status.
    pub status: MutantStatus,
    /// Full outcome detail, when recorded.
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

/// Cached results for every finalized mutant of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Schema version the record was written with.
    #[serde(default)]
    pub schema_version: u32,
    /// Source file the mutants belong to.
    pub source_file: String,
    /// Mutant records by id.
    #[serde(default)]
    pub mutants: BTreeMap<String, MutantRecord>,
}

impl FileRecord {
    /// Empty record for `source_file` at the current schema version.
    pub fn new(source_file: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            source_file: source_file.into(),
            mutants: BTreeMap::new(),
        }
    }
}

/// Cached suite stats plus bookkeeping for one stats collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    /// Schema version the record was written with.
    #[serde(default)]
    pub schema_version: u32,
    /// Wall-clock cost of the stats run, milliseconds.
    #[serde(default)]
    pub stats_duration_ms: u64,
    /// Collected timing and coverage data.
    #[serde(default)]
    pub suite: SuiteStats,
}

impl StatsRecord {
    /// Record wrapping `suite` at the current schema version.
    pub fn new(suite: SuiteStats, stats_duration_ms: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            stats_duration_ms,
            suite,
        }
    }
}

/// Filesystem-backed cache rooted at one directory.
///
/// Layout mirrors the mutated tree: `<root>/<source_file>.meta.json` per
/// source file, plus `<root>/stats.json`. Every write goes to a temporary
/// sibling, is flushed, then atomically renamed over the destination, so a
/// reader never observes a partial record.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for `source_file`.
    ///
    /// Only normal path components are kept: root, prefix, and `..` segments
    /// are dropped, so the record always lands under the cache root even for
    /// an absolute or parent-relative source path.
    pub fn file_record_path(&self, source_file: &Path) -> PathBuf {
        let mut relative = PathBuf::new();
        for component in source_file.components() {
            if let Component::Normal(part) = component {
                relative.push(part);
            }
        }
        let mut name = self.root.join(relative).into_os_string();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    /// Path of the stats record.
    pub fn stats_path(&self) -> PathBuf {
        self.root.join("stats.json")
    }

    /// Load the record for `source_file`. Absent or unreadable records load
    /// as `None`; the cache is advisory and regenerates.
    pub fn load_file_record(&self, source_file: &Path) -> Result<Option<FileRecord>, PersistError> {
        self.load_tolerant(&self.file_record_path(source_file))
    }

    /// Write the record for its source file.
    pub fn save_file_record(&self, record: &FileRecord) -> Result<(), PersistError> {
        let path = self.file_record_path(Path::new(&record.source_file));
        self.write_atomic(&path, record)
    }

    /// Load cached suite stats.
    pub fn load_stats(&self) -> Result<Option<StatsRecord>, PersistError> {
        self.load_tolerant(&self.stats_path())
    }

    /// Write suite stats.
    pub fn save_stats(&self, record: &StatsRecord) -> Result<(), PersistError> {
        self.write_atomic(&self.stats_path(), record)
    }

    /// Every persisted file record under the cache root.
    pub fn load_all_file_records(&self) -> Result<Vec<FileRecord>, PersistError> {
        let mut records = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(PersistError::Io(err)),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                } else if path
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(".meta.json"))
                {
                    if let Some(record) = self.load_tolerant::<FileRecord>(&path)? {
                        records.push(record);
                    }
                }
            }
        }
        records.sort_by(|a, b| a.source_file.cmp(&b.source_file));
        Ok(records)
    }

    fn load_tolerant<T>(&self, path: &Path) -> Result<Option<T>, PersistError>
    where
        T: serde::de::DeserializeOwned + SchemaVersioned,
    {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PersistError::Io(err)),
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                if value.schema_version() > SCHEMA_VERSION {
                    warn!(
                        path = %path.display(),
                        found = value.schema_version(),
                        supported = SCHEMA_VERSION,
                        "record written by a newer version; loading best-effort"
                    );
                }
                Ok(Some(value))
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "unreadable cache record ignored"
                );
                Ok(None)
            }
        }
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), PersistError> {
        let parent = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)?;

        let json = serde_json::to_vec_pretty(value)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| PersistError::Io(err.error))?;
        Ok(())
    }
}

/// Schema version accessor for tolerant loading.
trait SchemaVersioned {
    fn schema_version(&self) -> u32;
}

impl SchemaVersioned for FileRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl SchemaVersioned for StatsRecord {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}
