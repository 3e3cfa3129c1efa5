//! Conflict detection and resolution
//!
//! Two-phase protocol around the repository workspace:
//!
//! 1. Detection - merge the head onto a fresh base, collect conflicted files
//!    with their markers, then abort and release. The working tree is never
//!    left mid-conflict between calls.
//! 2. Resolution - reproduce the same merge, apply supplied contents, refuse
//!    to commit while anything is still conflicted, then commit and push.
//!
//! The clean path (no human involved) is [`ConflictResolver::merge_clean`].
//! Every phase runs under a [`WorkspaceLease`] that is released on all exits.

use crate::error::{Error, Result};
use crate::types::{ConflictRecord, MergeMethod, RepositoryId};
use crate::workspace::{GitWorkspace, MergeMode, MergeOutcome, PushOutcome, RepoLocks, WorkspaceLease};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Conflict marker that must not survive a resolution
pub const CONFLICT_MARKER: &str = "<<<<<<<";

/// A conflicted file as found during detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFile {
    /// Repository-relative path
    pub path: String,
    /// Working-tree content including conflict markers
    pub content: String,
}

/// Resolved content for a conflicted path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Repository-relative path
    pub path: String,
    /// Fully resolved content
    pub content: String,
}

/// Detection result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Base commit the head was merged onto
    pub base_sha: String,
    /// Conflicted files (empty when the merge is clean)
    pub files: Vec<ConflictFile>,
}

impl ConflictReport {
    /// Whether the head merges without conflicts
    pub fn is_clean(&self) -> bool {
        self.files.is_empty()
    }

    /// Conflicted paths
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Snapshot kept on the queue entry until resolution
    pub fn record(&self) -> ConflictRecord {
        ConflictRecord {
            base_sha: self.base_sha.clone(),
            paths: self.paths(),
        }
    }
}

/// What to integrate and where
#[derive(Debug, Clone)]
pub struct MergeTarget {
    /// Repository
    pub repository: RepositoryId,
    /// Change request number
    pub number: u64,
    /// Change request title
    pub title: String,
    /// Head branch name
    pub head_ref: String,
    /// Base branch name
    pub base_branch: String,
    /// Merge method
    pub method: MergeMethod,
}

/// Commit message for integrating a change request
pub fn commit_message(target: &MergeTarget, method: MergeMethod) -> String {
    match method {
        MergeMethod::Squash => format!("{} (#{})", target.title, target.number),
        MergeMethod::Merge | MergeMethod::Rebase => format!(
            "Merge pull request #{} from {}\n\n{}",
            target.number, target.head_ref, target.title
        ),
    }
}

/// Conflict detector / resolver over the workspace collaborator
pub struct ConflictResolver {
    workspace: Arc<dyn GitWorkspace>,
    locks: Arc<RepoLocks>,
    remote: String,
}

impl ConflictResolver {
    /// Create a resolver pushing to and fetching from `remote`
    pub fn new(workspace: Arc<dyn GitWorkspace>, locks: Arc<RepoLocks>, remote: impl Into<String>) -> Self {
        Self {
            workspace,
            locks,
            remote: remote.into(),
        }
    }

    async fn lease(&self, repo: &RepositoryId) -> Result<WorkspaceLease> {
        self.locks.acquire(repo, Arc::clone(&self.workspace)).await
    }

    fn head_rev(&self, target: &MergeTarget) -> String {
        format!("{}/{}", self.remote, target.head_ref)
    }

    /// Fetch, check out the base branch and fast-forward it to the remote
    async fn prepare_base(&self, lease: &WorkspaceLease, base_branch: &str) -> Result<String> {
        let git = lease.workspace();
        let path = lease.path();
        git.fetch(path, &self.remote).await?;
        git.checkout(path, base_branch).await?;
        git.reset_hard(path, &format!("{}/{base_branch}", self.remote))
            .await?;
        git.rev_parse(path, "HEAD").await
    }

    /// Detection phase: report conflicted files, leaving the workspace clean
    pub async fn check_conflicts(&self, target: &MergeTarget) -> Result<ConflictReport> {
        let lease = self.lease(&target.repository).await?;
        let result = self.detect(&lease, target).await;
        finish(lease, result, false).await
    }

    async fn detect(&self, lease: &WorkspaceLease, target: &MergeTarget) -> Result<ConflictReport> {
        let git = lease.workspace();
        let path = lease.path();
        let base_sha = self.prepare_base(lease, &target.base_branch).await?;

        let outcome = git
            .merge(path, &self.head_rev(target), MergeMode::NoCommitNoFf)
            .await?;

        let files = match outcome {
            MergeOutcome::Clean { .. } => Vec::new(),
            MergeOutcome::Conflicted(paths) => {
                let mut files = Vec::with_capacity(paths.len());
                for file in paths {
                    let content = git.read_file(path, &file).await?;
                    files.push(ConflictFile { path: file, content });
                }
                files
            }
        };

        // Never leave the merge open, whatever it produced
        git.merge_abort(path).await?;
        git.reset_hard(path, &base_sha).await?;

        info!(
            repository = %target.repository,
            change_request = target.number,
            conflicts = files.len(),
            "conflict detection finished"
        );
        Ok(ConflictReport { base_sha, files })
    }

    /// Resolution phase: apply resolutions, commit and push the base branch.
    ///
    /// Returns the new base commit. Fails with
    /// [`Error::IncompleteResolution`] without committing if any conflicted
    /// path is left unresolved or still carries a marker, and with
    /// [`Error::ConcurrentBaseUpdate`] if the base moved since `recorded` was
    /// taken, the conflict set changed, or the push was refused.
    pub async fn resolve_conflicts(
        &self,
        target: &MergeTarget,
        resolutions: &[Resolution],
        recorded: Option<&ConflictRecord>,
    ) -> Result<String> {
        let lease = self.lease(&target.repository).await?;
        let result = self.resolve(&lease, target, resolutions, recorded).await;
        let changed = result.is_ok();
        finish(lease, result, changed).await
    }

    async fn resolve(
        &self,
        lease: &WorkspaceLease,
        target: &MergeTarget,
        resolutions: &[Resolution],
        recorded: Option<&ConflictRecord>,
    ) -> Result<String> {
        let git = lease.workspace();
        let path = lease.path();
        let base_sha = self.prepare_base(lease, &target.base_branch).await?;

        if let Some(record) = recorded
            && record.base_sha != base_sha
        {
            warn!(
                repository = %target.repository,
                change_request = target.number,
                detected = %record.base_sha,
                current = %base_sha,
                "base moved since conflict detection"
            );
            return Err(Error::ConcurrentBaseUpdate(target.base_branch.clone()));
        }

        // Human-resolved integrations are always committed as a merge or a squash
        let (mode, method) = match target.method {
            MergeMethod::Squash => (MergeMode::Squash, MergeMethod::Squash),
            MergeMethod::Merge | MergeMethod::Rebase => (MergeMode::NoCommitNoFf, MergeMethod::Merge),
        };

        let conflicted = match git.merge(path, &self.head_rev(target), mode).await? {
            MergeOutcome::Conflicted(paths) => paths,
            MergeOutcome::Clean { .. } => Vec::new(),
        };

        if let Some(record) = recorded {
            let expected: BTreeSet<&str> = record.paths.iter().map(String::as_str).collect();
            let actual: BTreeSet<&str> = conflicted.iter().map(String::as_str).collect();
            if expected != actual {
                warn!(
                    repository = %target.repository,
                    change_request = target.number,
                    ?expected,
                    ?actual,
                    "conflict set changed since detection"
                );
                return Err(Error::ConcurrentBaseUpdate(target.base_branch.clone()));
            }
        }

        for file in &conflicted {
            let Some(resolution) = resolutions.iter().find(|r| &r.path == file) else {
                continue;
            };
            if resolution.content.contains(CONFLICT_MARKER) {
                continue;
            }
            git.write_file(path, file, &resolution.content).await?;
            git.stage(path, file).await?;
        }

        // `git add` marks a file resolved even if markers remain, so check content too
        let mut remaining: BTreeSet<String> = git.conflicted_paths(path).await?.into_iter().collect();
        for file in &conflicted {
            if git.read_file(path, file).await?.contains(CONFLICT_MARKER) {
                remaining.insert(file.clone());
            }
        }
        if !remaining.is_empty() {
            return Err(Error::IncompleteResolution(remaining.into_iter().collect()));
        }

        let sha = git.commit(path, &commit_message(target, method)).await?;
        match git.push(path, &self.remote, &target.base_branch).await? {
            PushOutcome::Pushed => {
                info!(
                    repository = %target.repository,
                    change_request = target.number,
                    sha = %sha,
                    "conflict resolution pushed"
                );
                Ok(sha)
            }
            PushOutcome::Rejected(message) => {
                warn!(
                    repository = %target.repository,
                    change_request = target.number,
                    %message,
                    "resolution push rejected"
                );
                Err(Error::ConcurrentBaseUpdate(target.base_branch.clone()))
            }
        }
    }

    /// Clean path: merge with the entry's method, commit and push.
    ///
    /// Fails with [`Error::MergeConflict`] if the base moved into a conflict
    /// since detection, and with [`Error::PushRejected`] if the remote refused
    /// the push. Returns the new base commit.
    pub async fn merge_clean(&self, target: &MergeTarget) -> Result<String> {
        let lease = self.lease(&target.repository).await?;
        let result = self.integrate(&lease, target).await;
        let changed = result.is_ok();
        finish(lease, result, changed).await
    }

    async fn integrate(&self, lease: &WorkspaceLease, target: &MergeTarget) -> Result<String> {
        let git = lease.workspace();
        let path = lease.path();
        let base_sha = self.prepare_base(lease, &target.base_branch).await?;

        let mode = match target.method {
            MergeMethod::Merge => MergeMode::NoCommitNoFf,
            MergeMethod::Squash => MergeMode::Squash,
            MergeMethod::Rebase => MergeMode::Rebase,
        };

        let sha = match git.merge(path, &self.head_rev(target), mode).await? {
            MergeOutcome::Conflicted(paths) => return Err(Error::MergeConflict { base_sha, paths }),
            MergeOutcome::Clean { needs_commit: true } => {
                git.commit(path, &commit_message(target, target.method))
                    .await?
            }
            MergeOutcome::Clean { needs_commit: false } => git.rev_parse(path, "HEAD").await?,
        };

        match git.push(path, &self.remote, &target.base_branch).await? {
            PushOutcome::Pushed => {
                info!(
                    repository = %target.repository,
                    change_request = target.number,
                    method = %target.method,
                    sha = %sha,
                    "merged"
                );
                Ok(sha)
            }
            PushOutcome::Rejected(message) => Err(Error::PushRejected(message)),
        }
    }
}

/// Release the lease, preferring the operation's own error over a release error
async fn finish<T>(lease: WorkspaceLease, result: Result<T>, changed: bool) -> Result<T> {
    let repo = lease.repository().clone();
    let released = lease.release(changed).await;
    match (result, released) {
        (Err(e), Err(release_err)) => {
            warn!(repository = %repo, error = %release_err, "workspace release failed");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Ok(value), Ok(())) => Ok(value),
    }
}
