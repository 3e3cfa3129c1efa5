//! Git workspace collaborator
//!
//! The queue never shells out to git directly. Everything destructive goes
//! through [`GitWorkspace`], and access to a repository's working tree is
//! only ever obtained through a [`WorkspaceLease`] from [`RepoLocks`].

mod git;
mod lock;

pub use git::GitCli;
pub use lock::{RepoLocks, WorkspaceLease};

use crate::error::Result;
use crate::types::RepositoryId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// How a head ref is combined with the checked-out base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// `merge --no-commit --no-ff`: stage a merge, leave it uncommitted
    NoCommitNoFf,
    /// `merge --squash`: stage the combined changes as a single commit
    Squash,
    /// Replay the head's commits onto the base
    Rebase,
}

/// Result of a merge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged without conflicts
    Clean {
        /// Whether a commit is still required to finish the operation
        needs_commit: bool,
    },
    /// Merge stopped with conflicts (still in progress in the working tree)
    Conflicted(Vec<String>),
}

/// Result of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote accepted the update
    Pushed,
    /// Remote refused the update (usually because the branch moved)
    Rejected(String),
}

/// Git operations the queue depends on.
///
/// Implementations must make `acquire_repo` exclusive per repository only in
/// combination with [`RepoLocks`]; the trait itself only prepares and hands
/// out the working tree path.
#[async_trait]
pub trait GitWorkspace: Send + Sync {
    /// Prepare the repository's working tree and return its path
    async fn acquire_repo(&self, repo: &RepositoryId) -> Result<PathBuf>;

    /// Hand the working tree back; `changed` is true if the base was pushed
    async fn release_repo(&self, repo: &RepositoryId, changed: bool) -> Result<()>;

    /// Fetch all refs from `remote`
    async fn fetch(&self, path: &Path, remote: &str) -> Result<()>;

    /// Check out a local branch
    async fn checkout(&self, path: &Path, branch: &str) -> Result<()>;

    /// Reset the branch and working tree to `rev`, discarding local changes
    async fn reset_hard(&self, path: &Path, rev: &str) -> Result<()>;

    /// Resolve a revision to a commit SHA
    async fn rev_parse(&self, path: &Path, rev: &str) -> Result<String>;

    /// Combine `rev` into the checked-out branch
    async fn merge(&self, path: &Path, rev: &str, mode: MergeMode) -> Result<MergeOutcome>;

    /// Abort any in-progress merge or rebase (no-op when none is running)
    async fn merge_abort(&self, path: &Path) -> Result<()>;

    /// Paths with unresolved conflicts
    async fn conflicted_paths(&self, path: &Path) -> Result<Vec<String>>;

    /// Read a working-tree file
    async fn read_file(&self, path: &Path, file: &str) -> Result<String>;

    /// Overwrite a working-tree file
    async fn write_file(&self, path: &Path, file: &str, content: &str) -> Result<()>;

    /// Stage a path
    async fn stage(&self, path: &Path, file: &str) -> Result<()>;

    /// Commit staged changes and return the new commit SHA
    async fn commit(&self, path: &Path, message: &str) -> Result<String>;

    /// Push `branch` to `remote`
    async fn push(&self, path: &Path, remote: &str, branch: &str) -> Result<PushOutcome>;
}
