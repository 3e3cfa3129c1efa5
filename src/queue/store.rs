//! Per-repository queue store
//!
//! Every repository owns one `RepoQueue` behind its own mutex. Mutations are
//! applied to a working copy, persisted, then swapped in, so a failed write
//! leaves the in-memory queue untouched. The mutex is only ever held for
//! metadata work and never across a workspace acquisition.

use super::order::{canonical_order, insertion_index, renumber, validate_stack_order};
use super::storage::{self, QueueSnapshot};
use crate::error::{Error, Result};
use crate::types::{
    ChangeRequestId, CiStatus, EntryId, FailureReason, MergeMethod, QueueEntry, QueueStatus,
    RepositoryId, StackMembership,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Request to admit a change request into its repository's queue
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Change request to queue
    pub change_request: ChangeRequestId,
    /// Higher merges sooner
    pub priority: i32,
    /// Merge method used when integrating
    pub merge_method: MergeMethod,
    /// Stack membership, if any
    pub stack: Option<StackMembership>,
    /// Who (or which rule) admitted the change
    pub added_by: String,
    /// Head commit at admission
    pub head_sha: Option<String>,
    /// Approval count at admission
    pub approvals: u32,
}

impl EnqueueRequest {
    /// Request with default priority, merge method and no stack
    pub fn new(change_request: ChangeRequestId, added_by: impl Into<String>) -> Self {
        Self {
            change_request,
            priority: 0,
            merge_method: MergeMethod::default(),
            stack: None,
            added_by: added_by.into(),
            head_sha: None,
            approvals: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RepoQueue {
    /// Active entries in queue order (`position` == index)
    active: Vec<QueueEntry>,
    /// Terminal entries, oldest first
    history: Vec<QueueEntry>,
}

impl RepoQueue {
    fn find(&self, id: EntryId) -> Option<&QueueEntry> {
        self.active
            .iter()
            .chain(self.history.iter())
            .find(|e| e.id == id)
    }

    fn snapshot(&self, repo: &RepositoryId) -> QueueSnapshot {
        let mut snapshot = QueueSnapshot::new(repo.clone());
        snapshot.entries = self
            .active
            .iter()
            .chain(self.history.iter())
            .cloned()
            .collect();
        snapshot
    }
}

/// Ordered queue entries of every repository
#[derive(Debug, Default)]
pub struct QueueStore {
    repos: RwLock<HashMap<RepositoryId, Arc<Mutex<RepoQueue>>>>,
    index: RwLock<HashMap<EntryId, RepositoryId>>,
    state_dir: Option<PathBuf>,
}

impl QueueStore {
    /// Create a store that keeps everything in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Create an empty store persisting under `state_dir`
    pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            ..Self::default()
        }
    }

    /// Load persisted queues from `state_dir`.
    ///
    /// Positions are recomputed rather than trusted. Entries found in
    /// `merging` were interrupted by a restart: they are failed with
    /// [`FailureReason::Interrupted`] and returned so callers can report them.
    pub fn load(state_dir: impl Into<PathBuf>) -> Result<(Self, Vec<QueueEntry>)> {
        let state_dir = state_dir.into();
        let mut repos = HashMap::new();
        let mut index = HashMap::new();
        let mut interrupted = Vec::new();
        let now = Utc::now();

        for snapshot in storage::load_queues(&state_dir)? {
            let repo = snapshot.repository;
            let (mut active, mut history): (Vec<_>, Vec<_>) =
                snapshot.entries.into_iter().partition(QueueEntry::is_active);

            for entry in active.iter_mut().filter(|e| e.status == QueueStatus::Merging) {
                warn!(entry = %entry.id, change_request = entry.change_request, "merge interrupted by restart");
                entry.status = QueueStatus::Failed;
                entry.failure = Some(FailureReason::Interrupted);
                entry.merging_started_at = None;
                entry.updated_at = now;
                interrupted.push(entry.clone());
            }
            let (still_active, failed): (Vec<_>, Vec<_>) =
                active.into_iter().partition(QueueEntry::is_active);
            active = still_active;
            history.extend(failed);

            active.sort_by_key(|e| e.position.unwrap_or(usize::MAX));
            if validate_stack_order(&active).is_err() {
                warn!(repository = %repo, "persisted queue violates stack order, re-sorting");
                canonical_order(&mut active);
            }
            renumber(&mut active);
            for entry in &mut history {
                entry.position = None;
            }

            let queue = RepoQueue { active, history };
            for entry in queue.active.iter().chain(queue.history.iter()) {
                index.insert(entry.id, repo.clone());
            }
            if !interrupted.is_empty() {
                storage::save_queue(&state_dir, &queue.snapshot(&repo))?;
            }
            info!(repository = %repo, active = queue.active.len(), "loaded queue");
            repos.insert(repo, Arc::new(Mutex::new(queue)));
        }

        let store = Self {
            repos: RwLock::new(repos),
            index: RwLock::new(index),
            state_dir: Some(state_dir),
        };
        Ok((store, interrupted))
    }

    async fn repo_queue(&self, repo: &RepositoryId) -> Arc<Mutex<RepoQueue>> {
        if let Some(queue) = self.repos.read().await.get(repo) {
            return Arc::clone(queue);
        }
        let mut repos = self.repos.write().await;
        Arc::clone(repos.entry(repo.clone()).or_default())
    }

    async fn existing_queue(&self, repo: &RepositoryId) -> Option<Arc<Mutex<RepoQueue>>> {
        self.repos.read().await.get(repo).map(Arc::clone)
    }

    /// Apply a mutation to a working copy of the repository queue, persist
    /// it, then commit it.
    async fn mutate<T>(
        &self,
        repo: &RepositoryId,
        f: impl FnOnce(&mut RepoQueue) -> Result<T>,
    ) -> Result<T> {
        let queue = self.repo_queue(repo).await;
        let mut guard = queue.lock().await;
        let mut working = guard.clone();
        let value = f(&mut working)?;
        if let Some(dir) = &self.state_dir {
            storage::save_queue(dir, &working.snapshot(repo))?;
        }
        *guard = working;
        Ok(value)
    }

    /// Admit a change request.
    ///
    /// Fails with [`Error::AlreadyQueued`] if the change request already has
    /// an active entry. The entry starts `pending` at the slot the ordering
    /// rules assign it; positions stay dense.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<QueueEntry> {
        let repo = request.change_request.repository.clone();
        let now = Utc::now();

        let entry = self
            .mutate(&repo, |queue| {
                if let Some(existing) = queue
                    .active
                    .iter()
                    .find(|e| e.change_request == request.change_request.number)
                {
                    return Err(Error::AlreadyQueued {
                        change_request: request.change_request.clone(),
                        entry: existing.id,
                    });
                }

                let entry = QueueEntry {
                    id: EntryId::generate(),
                    repository: repo.clone(),
                    change_request: request.change_request.number,
                    stack: request.stack,
                    status: QueueStatus::Pending,
                    priority: request.priority,
                    position: None,
                    ci_status: CiStatus::Pending,
                    merge_method: request.merge_method,
                    added_by: request.added_by,
                    added_at: now,
                    updated_at: now,
                    head_sha: request.head_sha,
                    approvals_at_admission: request.approvals,
                    failure: None,
                    resolvable: false,
                    conflict: None,
                    cancel_requested: false,
                    merging_started_at: None,
                    merge_sha: None,
                };

                let at = insertion_index(&queue.active, &entry);
                queue.active.insert(at, entry);
                renumber(&mut queue.active);
                Ok(queue.active[at].clone())
            })
            .await?;

        self.index.write().await.insert(entry.id, repo);
        info!(
            entry = %entry.id,
            change_request = %request.change_request,
            position = ?entry.position,
            priority = entry.priority,
            "enqueued"
        );
        Ok(entry)
    }

    /// Remove an entry from the active queue as `cancelled`.
    ///
    /// Remaining positions are compacted. Removing an entry that is already
    /// terminal is a no-op that returns it unchanged. Entries in `merging`
    /// cannot be removed here; the driver defers their cancellation.
    pub async fn dequeue(&self, id: EntryId) -> Result<QueueEntry> {
        let repo = self.repository_of(id).await?;
        let entry = self
            .mutate(&repo, |queue| {
                let Some(index) = queue.active.iter().position(|e| e.id == id) else {
                    return queue.find(id).cloned().ok_or(Error::EntryNotFound(id));
                };
                let current = queue.active[index].status;
                if current == QueueStatus::Merging {
                    return Err(Error::InvalidTransition {
                        entry: id,
                        from: current,
                        to: QueueStatus::Cancelled,
                    });
                }
                let mut entry = queue.active.remove(index);
                finish(&mut entry, QueueStatus::Cancelled);
                renumber(&mut queue.active);
                queue.history.push(entry.clone());
                Ok(entry)
            })
            .await?;
        debug!(entry = %id, status = %entry.status, "dequeued");
        Ok(entry)
    }

    /// Replace the order of a repository's active queue.
    ///
    /// `ordered` must name exactly the active entries. The new order must keep
    /// stack members base-most first and leave an in-flight merge at the head.
    /// On any error the queue is unchanged.
    pub async fn reorder(&self, repo: &RepositoryId, ordered: &[EntryId]) -> Result<Vec<QueueEntry>> {
        let reordered = self
            .mutate(repo, |queue| {
                let current: HashSet<EntryId> = queue.active.iter().map(|e| e.id).collect();
                let requested: HashSet<EntryId> = ordered.iter().copied().collect();
                if requested.len() != ordered.len() {
                    return Err(Error::InvalidReorder("duplicate entry ids".to_string()));
                }
                if requested != current {
                    let missing = current.difference(&requested).count();
                    let unknown = requested.difference(&current).count();
                    return Err(Error::InvalidReorder(format!(
                        "expected the {} active entries ({missing} missing, {unknown} unknown)",
                        current.len()
                    )));
                }

                let mut by_id: HashMap<EntryId, QueueEntry> =
                    queue.active.drain(..).map(|e| (e.id, e)).collect();
                let mut next: Vec<QueueEntry> = ordered
                    .iter()
                    .filter_map(|id| by_id.remove(id))
                    .collect();

                validate_stack_order(&next)?;
                if let Some(merging) = next.iter().position(|e| e.status == QueueStatus::Merging)
                    && merging != 0
                {
                    return Err(Error::InvalidReorder(
                        "an entry that is merging must stay at the head".to_string(),
                    ));
                }

                renumber(&mut next);
                queue.active = next;
                Ok(queue.active.clone())
            })
            .await?;
        info!(repository = %repo, entries = reordered.len(), "queue reordered");
        Ok(reordered)
    }

    /// Move an entry to `to` if its current status is one of `allowed_from`.
    ///
    /// `mutate` runs on the entry before the status change is applied.
    /// Entering a terminal status removes the entry from the position
    /// sequence and compacts the rest.
    pub async fn transition(
        &self,
        id: EntryId,
        allowed_from: &[QueueStatus],
        to: QueueStatus,
        mutate: impl FnOnce(&mut QueueEntry),
    ) -> Result<QueueEntry> {
        let repo = self.repository_of(id).await?;
        let (entry, from) = self
            .mutate(&repo, |queue| {
                if let Some(index) = queue.active.iter().position(|e| e.id == id) {
                    let from = queue.active[index].status;
                    check_allowed(id, from, allowed_from, to)?;
                    mutate(&mut queue.active[index]);
                    if to.is_terminal() {
                        let mut entry = queue.active.remove(index);
                        finish(&mut entry, to);
                        renumber(&mut queue.active);
                        queue.history.push(entry.clone());
                        return Ok((entry, from));
                    }
                    let entry = &mut queue.active[index];
                    entry.status = to;
                    entry.updated_at = Utc::now();
                    return Ok((entry.clone(), from));
                }

                let entry = queue
                    .history
                    .iter_mut()
                    .find(|e| e.id == id)
                    .ok_or(Error::EntryNotFound(id))?;
                let from = entry.status;
                // Terminal entries are never reused as active ones
                if !to.is_terminal() {
                    return Err(Error::InvalidTransition { entry: id, from, to });
                }
                check_allowed(id, from, allowed_from, to)?;
                mutate(entry);
                entry.status = to;
                entry.updated_at = Utc::now();
                Ok((entry.clone(), from))
            })
            .await?;

        info!(
            entry = %id,
            change_request = entry.change_request,
            %from,
            %to,
            "entry transitioned"
        );
        Ok(entry)
    }

    /// Update non-status fields of an entry (active or history)
    pub async fn update(&self, id: EntryId, mutate: impl FnOnce(&mut QueueEntry)) -> Result<QueueEntry> {
        let repo = self.repository_of(id).await?;
        self.mutate(&repo, |queue| {
            let entry = queue
                .active
                .iter_mut()
                .chain(queue.history.iter_mut())
                .find(|e| e.id == id)
                .ok_or(Error::EntryNotFound(id))?;
            let status = entry.status;
            let position = entry.position;
            mutate(entry);
            // Status and position are owned by transition/reorder
            entry.status = status;
            entry.position = position;
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
        .await
    }

    /// Entry at position 0
    pub async fn head(&self, repo: &RepositoryId) -> Option<QueueEntry> {
        let queue = self.existing_queue(repo).await?;
        let guard = queue.lock().await;
        guard.active.first().cloned()
    }

    /// Active entries in queue order
    pub async fn active(&self, repo: &RepositoryId) -> Vec<QueueEntry> {
        match self.existing_queue(repo).await {
            Some(queue) => queue.lock().await.active.clone(),
            None => Vec::new(),
        }
    }

    /// Terminal entries, oldest first
    pub async fn history(&self, repo: &RepositoryId) -> Vec<QueueEntry> {
        match self.existing_queue(repo).await {
            Some(queue) => queue.lock().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Look up an entry by ID
    pub async fn get(&self, id: EntryId) -> Result<QueueEntry> {
        let repo = self.repository_of(id).await?;
        let queue = self
            .existing_queue(&repo)
            .await
            .ok_or(Error::EntryNotFound(id))?;
        let guard = queue.lock().await;
        guard.find(id).cloned().ok_or(Error::EntryNotFound(id))
    }

    /// Repository an entry belongs to
    pub async fn repository_of(&self, id: EntryId) -> Result<RepositoryId> {
        self.index
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::EntryNotFound(id))
    }

    /// The active entry of a change request, if any
    pub async fn active_for_change(&self, cr: &ChangeRequestId) -> Option<QueueEntry> {
        let queue = self.existing_queue(&cr.repository).await?;
        let guard = queue.lock().await;
        guard
            .active
            .iter()
            .find(|e| e.change_request == cr.number)
            .cloned()
    }

    /// The most recently finished entry of a change request, if any
    pub async fn latest_terminal_for_change(&self, cr: &ChangeRequestId) -> Option<QueueEntry> {
        let queue = self.existing_queue(&cr.repository).await?;
        let guard = queue.lock().await;
        guard
            .history
            .iter()
            .filter(|e| e.change_request == cr.number)
            .max_by_key(|e| e.updated_at)
            .cloned()
    }

    /// Repositories with a queue (possibly empty)
    pub async fn repositories(&self) -> Vec<RepositoryId> {
        let mut repos: Vec<_> = self.repos.read().await.keys().cloned().collect();
        repos.sort();
        repos
    }
}

fn check_allowed(
    id: EntryId,
    from: QueueStatus,
    allowed_from: &[QueueStatus],
    to: QueueStatus,
) -> Result<()> {
    if allowed_from.contains(&from) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { entry: id, from, to })
    }
}

fn finish(entry: &mut QueueEntry, to: QueueStatus) {
    entry.status = to;
    entry.position = None;
    entry.merging_started_at = None;
    entry.updated_at = Utc::now();
}
