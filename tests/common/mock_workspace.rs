//! In-memory git workspace for driving the queue without a repository
//!
//! Models one remote base branch (`base_sha`) and one working tree
//! (`head`). Conflicts are configured per head ref and show up whenever that
//! ref is merged.

#![allow(dead_code)]

use async_trait::async_trait;
use mergeq::error::{Error, Result};
use mergeq::types::RepositoryId;
use mergeq::workspace::{GitWorkspace, MergeMode, MergeOutcome, PushOutcome};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Call record for `merge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCall {
    pub rev: String,
    pub mode: MergeMode,
}

#[derive(Default)]
struct State {
    base_sha: String,
    head: String,
    conflicts: HashMap<String, Vec<(String, String)>>,
    files: HashMap<String, String>,
    conflicted: BTreeSet<String>,
    next_commit: u64,
    // Call tracking
    acquires: Vec<RepositoryId>,
    releases: Vec<(RepositoryId, bool)>,
    merges: Vec<MergeCall>,
    commits: Vec<String>,
    pushes: Vec<String>,
    aborts: usize,
    // Error injection
    reject_push: Option<String>,
    fail_merge: Option<String>,
    merge_delay: Option<(MergeMode, Duration)>,
    conflict_mode: Option<MergeMode>,
}

/// Mock [`GitWorkspace`]
pub struct MockWorkspace {
    remote: String,
    state: Mutex<State>,
}

impl Default for MockWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkspace {
    pub fn new() -> Self {
        Self {
            remote: "origin".to_string(),
            state: Mutex::new(State {
                base_sha: "base-0".to_string(),
                head: "base-0".to_string(),
                ..State::default()
            }),
        }
    }

    // === Setup ===

    /// Make merging `head_ref` conflict on the given `(path, content)` files
    pub fn set_conflicts(&self, head_ref: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .conflicts
            .insert(format!("{}/{head_ref}", self.remote), files);
    }

    /// Only merges in `mode` hit the configured conflicts
    pub fn conflict_only_in(&self, mode: MergeMode) {
        self.state.lock().unwrap().conflict_mode = Some(mode);
    }

    pub fn clear_conflicts(&self, head_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .conflicts
            .remove(&format!("{}/{head_ref}", self.remote));
    }

    /// Simulate someone else pushing to the base branch
    pub fn set_base_sha(&self, sha: &str) {
        self.state.lock().unwrap().base_sha = sha.to_string();
    }

    pub fn base_sha(&self) -> String {
        self.state.lock().unwrap().base_sha.clone()
    }

    // === Error injection ===

    pub fn reject_push(&self, msg: &str) {
        self.state.lock().unwrap().reject_push = Some(msg.to_string());
    }

    pub fn fail_merge(&self, msg: &str) {
        self.state.lock().unwrap().fail_merge = Some(msg.to_string());
    }

    /// Stall merges in `mode` for `delay`
    pub fn delay_merge(&self, mode: MergeMode, delay: Duration) {
        self.state.lock().unwrap().merge_delay = Some((mode, delay));
    }

    // === Call tracking ===

    pub fn acquire_count(&self) -> usize {
        self.state.lock().unwrap().acquires.len()
    }

    pub fn releases(&self) -> Vec<(RepositoryId, bool)> {
        self.state.lock().unwrap().releases.clone()
    }

    /// Every acquisition was paired with a release
    pub fn is_balanced(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.acquires.len() == state.releases.len()
    }

    pub fn merges(&self) -> Vec<MergeCall> {
        self.state.lock().unwrap().merges.clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.state.lock().unwrap().pushes.clone()
    }

    fn next_sha(state: &mut State, prefix: &str) -> String {
        state.next_commit += 1;
        format!("{prefix}-{}", state.next_commit)
    }
}

#[async_trait]
impl GitWorkspace for MockWorkspace {
    async fn acquire_repo(&self, repo: &RepositoryId) -> Result<PathBuf> {
        self.state.lock().unwrap().acquires.push(repo.clone());
        Ok(PathBuf::from(format!("/mock/{}/{}", repo.owner, repo.name)))
    }

    async fn release_repo(&self, repo: &RepositoryId, changed: bool) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .releases
            .push((repo.clone(), changed));
        Ok(())
    }

    async fn fetch(&self, _path: &Path, _remote: &str) -> Result<()> {
        Ok(())
    }

    async fn checkout(&self, _path: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn reset_hard(&self, _path: &Path, rev: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.head = if rev.starts_with(&format!("{}/", self.remote)) {
            state.base_sha.clone()
        } else {
            rev.to_string()
        };
        state.files.clear();
        state.conflicted.clear();
        Ok(())
    }

    async fn rev_parse(&self, _path: &Path, _rev: &str) -> Result<String> {
        Ok(self.state.lock().unwrap().head.clone())
    }

    async fn merge(&self, _path: &Path, rev: &str, mode: MergeMode) -> Result<MergeOutcome> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.merges.push(MergeCall {
                rev: rev.to_string(),
                mode,
            });
            state
                .merge_delay
                .and_then(|(m, d)| (m == mode).then_some(d))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.fail_merge.clone() {
            return Err(Error::Git(msg));
        }
        let files = match state.conflict_mode {
            Some(only) if only != mode => Vec::new(),
            _ => state.conflicts.get(rev).cloned().unwrap_or_default(),
        };
        if !files.is_empty() {
            let mut paths = Vec::with_capacity(files.len());
            for (path, content) in files {
                state.conflicted.insert(path.clone());
                state.files.insert(path.clone(), content);
                paths.push(path);
            }
            return Ok(MergeOutcome::Conflicted(paths));
        }
        if mode == MergeMode::Rebase {
            let sha = Self::next_sha(&mut state, "rebase");
            state.head = sha;
        }
        Ok(MergeOutcome::Clean {
            needs_commit: mode != MergeMode::Rebase,
        })
    }

    async fn merge_abort(&self, _path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.aborts += 1;
        state.conflicted.clear();
        Ok(())
    }

    async fn conflicted_paths(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .conflicted
            .iter()
            .cloned()
            .collect())
    }

    async fn read_file(&self, _path: &Path, file: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .files
            .get(file)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_file(&self, _path: &Path, file: &str, content: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(file.to_string(), content.to_string());
        Ok(())
    }

    async fn stage(&self, _path: &Path, file: &str) -> Result<()> {
        self.state.lock().unwrap().conflicted.remove(file);
        Ok(())
    }

    async fn commit(&self, _path: &Path, message: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.commits.push(message.to_string());
        let sha = Self::next_sha(&mut state, "merge");
        state.head = sha.clone();
        Ok(sha)
    }

    async fn push(&self, _path: &Path, _remote: &str, branch: &str) -> Result<PushOutcome> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.reject_push.clone() {
            return Ok(PushOutcome::Rejected(msg));
        }
        state.pushes.push(branch.to_string());
        state.base_sha = state.head.clone();
        Ok(PushOutcome::Pushed)
    }
}
