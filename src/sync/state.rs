//! Persisted dependency graph
//!
//! The snapshot at `<state_dir>/deps.json` records, per target, the hash of
//! every input it was last built from and the artifacts it produced, plus a
//! global `hashes` map and an `output -> inputs` edge list. It is read once
//! when planning starts and rewritten atomically when the run ends.
//!
//! During a run the graph is owned by a single aggregator task; workers only
//! send [`CompletionEvent`]s.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

pub const SNAPSHOT_VERSION: &str = "1";

/// What one target was last built from, and what it wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    /// Input key -> content hash, including the target's virtual config entry.
    pub inputs: BTreeMap<String, String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub completed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    pub version: String,
    /// Path -> hash as of the last clean, complete run.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Output -> the inputs it depends on.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetRecord>,
}

impl Default for DependencySnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            hashes: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            targets: BTreeMap::new(),
        }
    }
}

/// Sent by a worker after a target's artifacts and receipts are committed.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub target: String,
    pub inputs: BTreeMap<String, String>,
    pub outputs: Vec<String>,
}

#[derive(Debug)]
pub struct DependencyGraph {
    path: PathBuf,
    snapshot: DependencySnapshot,
}

impl DependencyGraph {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: DependencySnapshot::default(),
        }
    }

    /// Loads the snapshot. A missing file is a first run; an unreadable or
    /// corrupt one is discarded with a warning, which makes every target
    /// rebuild.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(err) => return Err(PipelineError::io(&path, err)),
        };
        match serde_json::from_str::<DependencySnapshot>(&text) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Ok(Self { path, snapshot }),
            Ok(snapshot) => {
                tracing::warn!(
                    path = %path.display(),
                    version = %snapshot.version,
                    "ignoring dependency snapshot with unsupported version"
                );
                Ok(Self::empty(path))
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "ignoring corrupt dependency snapshot"
                );
                Ok(Self::empty(path))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &DependencySnapshot {
        &self.snapshot
    }

    pub fn hashes(&self) -> &BTreeMap<String, String> {
        &self.snapshot.hashes
    }

    pub fn target(&self, name: &str) -> Option<&TargetRecord> {
        self.snapshot.targets.get(name)
    }

    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.snapshot.targets.keys().map(String::as_str)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.snapshot.dependencies.keys().map(String::as_str)
    }

    /// Target that last produced `output`.
    pub fn owner_of(&self, output: &str) -> Option<&str> {
        self.snapshot
            .targets
            .iter()
            .find(|(_, record)| record.outputs.iter().any(|o| o == output))
            .map(|(name, _)| name.as_str())
    }

    /// Replaces a target's record and its output edges.
    pub fn apply(&mut self, event: CompletionEvent) {
        if let Some(previous) = self.snapshot.targets.remove(&event.target) {
            for output in previous.outputs {
                self.snapshot.dependencies.remove(&output);
            }
        }
        let inputs: Vec<String> = event.inputs.keys().cloned().collect();
        for output in &event.outputs {
            self.snapshot
                .dependencies
                .insert(output.clone(), inputs.clone());
        }
        tracing::debug!(
            target_name = %event.target,
            outputs = event.outputs.len(),
            "dependency graph updated"
        );
        self.snapshot.targets.insert(
            event.target,
            TargetRecord {
                inputs: event.inputs,
                outputs: event.outputs,
                completed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        );
    }

    pub fn remove_target(&mut self, name: &str) -> Option<TargetRecord> {
        let record = self.snapshot.targets.remove(name)?;
        for output in &record.outputs {
            self.snapshot.dependencies.remove(output);
        }
        Some(record)
    }

    pub fn set_hashes(&mut self, hashes: BTreeMap<String, String>) {
        self.snapshot.hashes = hashes;
    }

    /// Targets with a recorded dependency on any changed path, each with the
    /// first such path.
    pub fn affected_targets(&self, changes: &ChangeSet) -> BTreeMap<String, String> {
        self.snapshot
            .targets
            .iter()
            .filter_map(|(name, record)| {
                record
                    .inputs
                    .keys()
                    .find(|input| changes.contains(input))
                    .map(|input| (name.clone(), input.clone()))
            })
            .collect()
    }

    /// Writes the snapshot through a temporary file in the same directory
    /// and renames it into place.
    pub fn save(&self) -> Result<(), PipelineError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|e| PipelineError::io(dir, e))?;
        let json = serde_json::to_vec_pretty(&self.snapshot)
            .map_err(|e| PipelineError::Internal(format!("failed to serialize snapshot: {e}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
        temp.write_all(&json)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| PipelineError::io(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e.error))?;
        tracing::debug!(path = %self.path.display(), "dependency snapshot saved");
        Ok(())
    }
}

// ============================================================================
// Change sets
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl ChangeSet {
    /// Difference between two `path -> hash` maps.
    pub fn compute(previous: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> Self {
        let mut changes = ChangeSet::default();
        for (path, hash) in current {
            match previous.get(path) {
                None => {
                    changes.added.insert(path.clone());
                }
                Some(old) if old != hash => {
                    changes.modified.insert(path.clone());
                }
                Some(_) => {}
            }
        }
        for path in previous.keys() {
            if !current.contains_key(path) {
                changes.removed.insert(path.clone());
            }
        }
        changes
    }

    /// An externally supplied change list (for example from version
    /// control). Every path is treated as modified.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modified: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.added.contains(path) || self.modified.contains(path) || self.removed.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// Every changed path, sorted.
    pub fn paths(&self) -> BTreeSet<&str> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.removed)
            .map(String::as_str)
            .collect()
    }
}
