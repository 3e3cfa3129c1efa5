//! Persistence for queue and check state under the service's state directory.

use crate::checks::CheckSnapshot;
use crate::error::{Error, Result};
use crate::types::{QueueEntry, RepositoryId};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

/// Directory holding one queue file per repository
const QUEUES_DIR: &str = "queues";

/// Filename for check-run state
const CHECKS_FILE: &str = "checks.toml";

/// Persisted queue of a single repository (active entries and history)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Format version
    pub version: u32,
    /// Repository the entries belong to
    pub repository: RepositoryId,
    /// All entries, active first in queue order
    #[serde(default)]
    pub entries: Vec<QueueEntry>,
}

impl QueueSnapshot {
    /// Create an empty snapshot
    pub const fn new(repository: RepositoryId) -> Self {
        Self {
            version: STATE_VERSION,
            repository,
            entries: Vec::new(),
        }
    }
}

/// Get path to a repository's queue file.
pub fn queue_path(state_dir: &Path, repo: &RepositoryId) -> PathBuf {
    state_dir
        .join(QUEUES_DIR)
        .join(format!("{}__{}.toml", repo.owner, repo.name))
}

/// Get path to the check-run state file.
pub fn checks_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CHECKS_FILE)
}

/// Load every persisted queue.
///
/// Returns an empty list if the queues directory doesn't exist.
pub fn load_queues(state_dir: &Path) -> Result<Vec<QueueSnapshot>> {
    let dir = state_dir.join(QUEUES_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let listing = fs::read_dir(&dir)
        .map_err(|e| Error::Storage(format!("failed to list {}: {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = listing
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    paths.iter().map(|p| read_toml(p)).collect()
}

/// Save a repository's queue.
pub fn save_queue(state_dir: &Path, snapshot: &QueueSnapshot) -> Result<()> {
    let path = queue_path(state_dir, &snapshot.repository);
    write_toml(&path, snapshot, "mergeq queue state")
}

/// Load check-run state.
///
/// Returns an empty snapshot if the file doesn't exist.
pub fn load_checks(state_dir: &Path) -> Result<CheckSnapshot> {
    let path = checks_path(state_dir);
    if !path.exists() {
        return Ok(CheckSnapshot::default());
    }
    read_toml(&path)
}

/// Save check-run state.
pub fn save_checks(state_dir: &Path, snapshot: &CheckSnapshot) -> Result<()> {
    write_toml(&checks_path(state_dir), snapshot, "mergeq check runs")
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Storage(format!("failed to read {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Storage(format!("failed to parse {}: {e}", path.display())))
}

/// Write via a temporary file and rename so readers never see a torn file.
fn write_toml<T: Serialize>(path: &Path, value: &T, title: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("no parent directory for {}", path.display())))?;

    if !dir.exists() {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", dir.display())))?;
    }

    let content = toml::to_string_pretty(value)
        .map_err(|e| Error::Storage(format!("failed to serialize {title}: {e}")))?;

    let content_with_header =
        format!("# {title}\n# Auto-generated - manual edits may be overwritten\n\n{content}");

    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content_with_header)
        .map_err(|e| Error::Storage(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Storage(format!("failed to replace {}: {e}", path.display())))?;

    Ok(())
}
