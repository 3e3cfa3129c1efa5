//! Repository lock
//!
//! One async mutex per repository serializes every workspace mutation
//! (detection, resolution, final merge). A [`WorkspaceLease`] pairs the mutex
//! guard with the collaborator's acquire/release calls: release always aborts
//! any in-progress merge first, and a lease dropped without an explicit
//! release (error path, timeout, cancelled future) is released in the
//! background before the mutex is given up.

use super::GitWorkspace;
use crate::error::{Error, Result};
use crate::types::RepositoryId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

/// Per-repository workspace locks
#[derive(Debug)]
pub struct RepoLocks {
    locks: Mutex<HashMap<RepositoryId, Arc<Mutex<()>>>>,
    acquire_timeout: Duration,
}

impl RepoLocks {
    /// Create a lock table; acquisitions give up after `acquire_timeout`
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    /// Acquire exclusive access to a repository's workspace.
    ///
    /// Fails with [`Error::WorkspaceUnavailable`] if the lock is not obtained
    /// within the acquire timeout.
    pub async fn acquire(
        &self,
        repo: &RepositoryId,
        workspace: Arc<dyn GitWorkspace>,
    ) -> Result<WorkspaceLease> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(repo.clone()).or_default())
        };

        let guard = tokio::time::timeout(self.acquire_timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                warn!(repository = %repo, "timed out waiting for workspace lock");
                Error::WorkspaceUnavailable(repo.clone())
            })?;

        // The mutex guard is dropped with `guard` if preparation fails
        let path = workspace.acquire_repo(repo).await?;
        debug!(repository = %repo, path = %path.display(), "workspace acquired");

        Ok(WorkspaceLease {
            repo: repo.clone(),
            path,
            workspace,
            guard: Some(guard),
            released: false,
        })
    }

    /// Whether a repository's workspace is currently held
    pub async fn is_locked(&self, repo: &RepositoryId) -> bool {
        let locks = self.locks.lock().await;
        locks.get(repo).is_some_and(|m| m.try_lock().is_err())
    }
}

/// Exclusive, scoped access to a repository's working tree
pub struct WorkspaceLease {
    repo: RepositoryId,
    path: PathBuf,
    workspace: Arc<dyn GitWorkspace>,
    guard: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl std::fmt::Debug for WorkspaceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceLease")
            .field("repo", &self.repo)
            .field("path", &self.path)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl WorkspaceLease {
    /// Working tree path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Repository the lease is for
    pub const fn repository(&self) -> &RepositoryId {
        &self.repo
    }

    /// Workspace collaborator
    pub fn workspace(&self) -> &dyn GitWorkspace {
        self.workspace.as_ref()
    }

    /// Abort any open merge, then release the workspace and the lock
    pub async fn release(mut self, changed: bool) -> Result<()> {
        self.released = true;
        let result = release_workspace(self.workspace.as_ref(), &self.repo, &self.path, changed).await;
        drop(self.guard.take());
        debug!(repository = %self.repo, changed, "workspace released");
        result
    }
}

async fn release_workspace(
    workspace: &dyn GitWorkspace,
    repo: &RepositoryId,
    path: &Path,
    changed: bool,
) -> Result<()> {
    if let Err(e) = workspace.merge_abort(path).await {
        warn!(repository = %repo, error = %e, "failed to abort merge before release");
    }
    workspace.release_repo(repo, changed).await
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(repository = %self.repo, "workspace lease dropped outside a runtime, not released");
            return;
        };

        warn!(repository = %self.repo, "workspace lease dropped without release, releasing");
        let workspace = Arc::clone(&self.workspace);
        let repo = self.repo.clone();
        let path = self.path.clone();
        let guard = self.guard.take();
        handle.spawn(async move {
            if let Err(e) = release_workspace(workspace.as_ref(), &repo, &path, false).await {
                error!(repository = %repo, error = %e, "background workspace release failed");
            }
            drop(guard);
        });
    }
}
