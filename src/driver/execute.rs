//! Queue driver execution - effectful operations
//!
//! `MergeQueue` owns the store, the check aggregator and the conflict
//! resolver, and drives every repository's head entry through
//! `ready -> merging -> merged | failed`. Only position 0 is ever advanced
//! past `ready`; other entries are capped at `running_ci`/`ready`.

use super::plan::{HeadStep, capped_status, ci_status, plan_head, readmission_allowed};
use crate::checks::{CheckAggregator, CheckRun, CheckRunInput, CheckSummary, RequiredChecks};
use crate::config::{Config, RepositoryConfig};
use crate::conflicts::{ConflictReport, ConflictResolver, MergeTarget, Resolution};
use crate::error::{Error, Result};
use crate::events::{EventRegistry, QueueEvent};
use crate::platform::ChangeRequestService;
use crate::queue::storage;
use crate::queue::{EnqueueRequest, QueueStore};
use crate::rules::{self, AutoMergeRule};
use crate::types::{
    ChangeRequest, ChangeRequestId, CiStatus, ConflictRecord, EntryId, FailureReason, MergeMethod,
    MergeableState, QueueEntry, QueueStatus, RepositoryId, StackMembership,
};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Statuses an entry may hold before it starts merging
const WAITING: [QueueStatus; 3] = [QueueStatus::Pending, QueueStatus::RunningCi, QueueStatus::Ready];

/// Event subscribers that stop draining for this long are dropped
const SUBSCRIBER_STALL_LIMIT: Duration = Duration::from_secs(60);

/// Driver view of a configured repository
#[derive(Debug, Clone)]
pub struct RepositorySettings {
    /// Repository
    pub id: RepositoryId,
    /// Branch changes are merged into
    pub base_branch: String,
    /// Checks that must pass before merging
    pub required_checks: Vec<String>,
    /// Auto-merge rules in evaluation order
    pub rules: Vec<AutoMergeRule>,
}

impl RepositorySettings {
    /// Settings with no required checks or rules
    pub fn new(id: RepositoryId, base_branch: impl Into<String>) -> Self {
        Self {
            id,
            base_branch: base_branch.into(),
            required_checks: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl From<&RepositoryConfig> for RepositorySettings {
    fn from(repo: &RepositoryConfig) -> Self {
        Self {
            id: repo.id(),
            base_branch: repo.base_branch.clone(),
            required_checks: repo.required_checks.clone(),
            rules: repo.auto_merge_rules.clone(),
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Served repositories
    pub repositories: Vec<RepositorySettings>,
    /// Deadline for the finalize phase of a merge
    pub merge_timeout: Duration,
    /// Where check state is persisted (`None` keeps it in memory)
    pub state_dir: Option<PathBuf>,
}

impl DriverSettings {
    /// Settings taken from the service configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            repositories: config.repositories.iter().map(RepositorySettings::from).collect(),
            merge_timeout: config.merge_timeout(),
            state_dir: Some(config.state_dir.clone()),
        }
    }
}

/// Request to admit a change request
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    /// Change request to queue
    pub change_request: ChangeRequestId,
    /// Higher merges sooner
    pub priority: i32,
    /// Merge method
    pub merge_method: MergeMethod,
    /// Stack membership
    pub stack: Option<StackMembership>,
    /// Who is admitting the change
    pub added_by: String,
}

impl AdmitRequest {
    /// Request with default priority and merge method
    pub fn new(change_request: ChangeRequestId, added_by: impl Into<String>) -> Self {
        Self {
            change_request,
            priority: 0,
            merge_method: MergeMethod::default(),
            stack: None,
            added_by: added_by.into(),
        }
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The entry left the queue (or was already terminal)
    Cancelled(QueueEntry),
    /// The entry is merging; it is cancelled once the merge finishes unless
    /// it merged
    Deferred(QueueEntry),
}

impl CancelOutcome {
    /// The entry after the request
    pub const fn entry(&self) -> &QueueEntry {
        match self {
            Self::Cancelled(entry) | Self::Deferred(entry) => entry,
        }
    }
}

/// Check state of a change request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatusReport {
    /// Counts over the current runs
    pub summary: CheckSummary,
    /// Required check evaluation
    pub required: RequiredChecks,
    /// Derived mergeable state
    pub mergeable: MergeableState,
    /// Current runs
    pub runs: Vec<CheckRun>,
}

/// A queue entry joined with its change request metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// The entry
    #[serde(flatten)]
    pub entry: QueueEntry,
    /// Change request title (absent if the lookup failed)
    pub title: Option<String>,
    /// Change request author
    pub author: Option<String>,
    /// Web URL
    pub html_url: Option<String>,
}

/// What a sweep cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries failed for exceeding the merge deadline
    pub timed_out: Vec<EntryId>,
    /// Event subscribers removed
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct AdvanceFlag {
    running: bool,
    again: bool,
}

type AdvanceFlags = Mutex<HashMap<RepositoryId, AdvanceFlag>>;

/// Clears a repository's running flag if an advance exits early
struct AdvanceGuard<'a> {
    flags: &'a AdvanceFlags,
    repo: &'a RepositoryId,
    armed: bool,
}

impl Drop for AdvanceGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
            flags.remove(self.repo);
        }
    }
}

/// The merge queue orchestrator
pub struct MergeQueue {
    store: QueueStore,
    checks: CheckAggregator,
    conflicts: ConflictResolver,
    platform: Arc<dyn ChangeRequestService>,
    events: Arc<EventRegistry>,
    repositories: HashMap<RepositoryId, RepositorySettings>,
    merge_timeout: Duration,
    state_dir: Option<PathBuf>,
    advancing: AdvanceFlags,
}

impl MergeQueue {
    /// Assemble a driver from its collaborators
    pub fn new(
        store: QueueStore,
        checks: CheckAggregator,
        conflicts: ConflictResolver,
        platform: Arc<dyn ChangeRequestService>,
        events: Arc<EventRegistry>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            checks,
            conflicts,
            platform,
            events,
            repositories: settings
                .repositories
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            merge_timeout: settings.merge_timeout,
            state_dir: settings.state_dir,
            advancing: Mutex::new(HashMap::new()),
        }
    }

    /// Event registry the driver publishes to
    pub const fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    /// Configured repositories, sorted
    pub fn repositories(&self) -> Vec<RepositoryId> {
        let mut repos: Vec<_> = self.repositories.keys().cloned().collect();
        repos.sort();
        repos
    }

    fn settings(&self, repo: &RepositoryId) -> Result<&RepositorySettings> {
        self.repositories
            .get(repo)
            .ok_or_else(|| Error::UnknownRepository(repo.clone()))
    }

    fn publish_entry(&self, entry: &QueueEntry) {
        self.events.publish(&QueueEvent::EntryUpdated {
            entry: entry.clone(),
        });
    }

    async fn persist_checks(&self) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let snapshot = self.checks.snapshot().await;
        if let Err(e) = storage::save_checks(dir, &snapshot) {
            warn!(error = %e, "failed to persist check runs");
        }
    }

    async fn check_state(
        &self,
        settings: &RepositorySettings,
        cr: &ChangeRequestId,
    ) -> (CheckSummary, RequiredChecks) {
        let summary = self.checks.get_summary(cr).await;
        let required = self
            .checks
            .are_required_passing(cr, &settings.required_checks)
            .await;
        (summary, required)
    }

    /// Pull check runs already reported upstream for `head_sha`
    async fn backfill(&self, settings: &RepositorySettings, cr: &ChangeRequestId, head_sha: &str) {
        match self.platform.list_check_runs(cr, head_sha).await {
            Ok(runs) => {
                debug!(change_request = %cr, runs = runs.len(), "backfilling check runs");
                for run in runs {
                    self.checks.upsert_check_run(cr, run).await;
                }
            }
            Err(e) => warn!(change_request = %cr, error = %e, "could not backfill check runs"),
        }
        self.checks
            .update_mergeable_state(cr, &settings.required_checks)
            .await;
    }

    // ---- admission ----

    /// Admit a change request into its repository's queue.
    ///
    /// The change request must be open. On admission its status is
    /// `running_ci` if checks are outstanding and `ready` otherwise, and the
    /// repository is re-evaluated. Returns the entry as it stands afterwards.
    pub async fn enqueue(&self, request: AdmitRequest) -> Result<QueueEntry> {
        let cr = request.change_request.clone();
        let settings = self.settings(&cr.repository)?;
        if let Some(existing) = self.store.active_for_change(&cr).await {
            return Err(Error::AlreadyQueued {
                change_request: cr,
                entry: existing.id,
            });
        }

        let change = self.platform.get_change_request(&cr).await?;
        if !change.is_open() {
            return Err(Error::ChangeRequestClosed(cr));
        }
        self.checks.set_head(&cr, &change.head_sha).await;
        self.backfill(settings, &cr, &change.head_sha).await;

        let entry = self
            .store
            .enqueue(EnqueueRequest {
                change_request: cr.clone(),
                priority: request.priority,
                merge_method: request.merge_method,
                stack: request.stack,
                added_by: request.added_by,
                head_sha: Some(change.head_sha.clone()),
                approvals: change.approval_count(),
            })
            .await?;
        self.publish_entry(&entry);

        let (summary, required) = self.check_state(settings, &cr).await;
        let ci = ci_status(&summary, &required);
        let classified = self
            .store
            .transition(entry.id, &[QueueStatus::Pending], capped_status(&summary, &required), |e| {
                e.ci_status = ci;
            })
            .await;
        if let Some(entry) = raced(classified)? {
            self.publish_entry(&entry);
        }
        self.persist_checks().await;

        self.advance(&cr.repository).await?;
        self.store.get(entry.id).await
    }

    /// Admit a change request if an auto-merge rule matches it.
    ///
    /// Changes whose last entry failed or was cancelled are only re-admitted
    /// after a new head commit or a different approval count.
    pub async fn try_auto_admit(&self, cr: &ChangeRequestId) -> Result<Option<QueueEntry>> {
        let settings = self.settings(&cr.repository)?;
        if !settings.rules.iter().any(|r| r.is_enabled) {
            return Ok(None);
        }
        if self.store.active_for_change(cr).await.is_some() {
            return Ok(None);
        }

        let change = self.platform.get_change_request(cr).await?;
        if !change.is_open() {
            return Ok(None);
        }
        let previous = self.store.latest_terminal_for_change(cr).await;
        if !readmission_allowed(previous.as_ref(), &change) {
            debug!(change_request = %cr, "unchanged since last attempt, not re-admitting");
            return Ok(None);
        }

        self.checks.set_head(cr, &change.head_sha).await;
        let runs = self.checks.check_runs(cr).await;
        let evaluation = rules::evaluate(&change, &settings.rules, &runs, Utc::now());
        let Some(rule) = evaluation.rule else {
            debug!(change_request = %cr, rejections = ?evaluation.rejections, "no auto-merge rule matched");
            return Ok(None);
        };

        info!(change_request = %cr, rule = %rule.name, "auto-admitting change request");
        let mut request = AdmitRequest::new(cr.clone(), format!("rule:{}", rule.name));
        request.merge_method = rule.merge_method;
        match self.enqueue(request).await {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::AlreadyQueued { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ---- check ingestion ----

    /// Record a check-run update and re-evaluate.
    ///
    /// Safe to call with duplicated or out-of-order deliveries.
    pub async fn record_check_run(&self, cr: &ChangeRequestId, input: CheckRunInput) -> Result<CheckRun> {
        let settings = self.settings(&cr.repository)?;
        if self.checks.is_unrecognized_commit(cr, &input.head_sha).await {
            self.refresh_head(cr).await?;
        }
        let outcome = self.checks.upsert_check_run(cr, input).await;

        if outcome.changed {
            let mergeable = self
                .checks
                .update_mergeable_state(cr, &settings.required_checks)
                .await;
            if let Some(entry) = self.store.active_for_change(cr).await {
                self.refresh_entry(settings, &entry).await?;
            }
            self.persist_checks().await;
            self.events.publish(&QueueEvent::CheckRunUpdated {
                repository: cr.repository.clone(),
                run: outcome.run.clone(),
                mergeable,
            });
        }

        if outcome.completed {
            if let Err(e) = self.try_auto_admit(cr).await {
                warn!(change_request = %cr, error = %e, "auto-merge evaluation failed");
            }
            self.advance(&cr.repository).await?;
        }
        Ok(outcome.run)
    }

    /// Learn a pushed head commit from the platform.
    ///
    /// Lookup failures are logged; the update is then ingested against the
    /// head recorded so far.
    async fn refresh_head(&self, cr: &ChangeRequestId) -> Result<()> {
        let change = match self.platform.get_change_request(cr).await {
            Ok(change) => change,
            Err(e) => {
                warn!(change_request = %cr, error = %e, "could not refresh head commit");
                return Ok(());
            }
        };
        self.checks.set_head(cr, &change.head_sha).await;

        if let Some(entry) = self.store.active_for_change(cr).await
            && entry.head_sha.as_deref() != Some(change.head_sha.as_str())
        {
            info!(change_request = %cr, sha = %change.head_sha, "head commit moved");
            let sha = change.head_sha;
            let entry = self.store.update(entry.id, |e| e.head_sha = Some(sha)).await?;
            self.publish_entry(&entry);
        }
        Ok(())
    }

    /// Bring a waiting entry's status and CI mirror in line with its checks
    async fn refresh_entry(&self, settings: &RepositorySettings, entry: &QueueEntry) -> Result<()> {
        if !matches!(entry.status, QueueStatus::RunningCi | QueueStatus::Ready) {
            return Ok(());
        }
        let (summary, required) = self.check_state(settings, &entry.change_request_id()).await;
        let status = capped_status(&summary, &required);
        let ci = ci_status(&summary, &required);
        if status == entry.status && ci == entry.ci_status {
            return Ok(());
        }
        let result = self
            .store
            .transition(entry.id, &[QueueStatus::RunningCi, QueueStatus::Ready], status, |e| {
                e.ci_status = ci;
            })
            .await;
        if let Some(entry) = raced(result)? {
            self.publish_entry(&entry);
        }
        Ok(())
    }

    // ---- advancement ----

    /// Re-evaluate a repository's head entry until it has to wait.
    ///
    /// Calls for the same repository never overlap: a call arriving while
    /// another is running makes the running one evaluate once more.
    pub async fn advance(&self, repo: &RepositoryId) -> Result<()> {
        {
            let mut flags = self.advancing.lock().unwrap_or_else(PoisonError::into_inner);
            let flag = flags.entry(repo.clone()).or_default();
            if flag.running {
                flag.again = true;
                return Ok(());
            }
            flag.running = true;
        }
        let mut guard = AdvanceGuard {
            flags: &self.advancing,
            repo,
            armed: true,
        };

        loop {
            let result = self.advance_head(repo).await;

            let mut flags = self.advancing.lock().unwrap_or_else(PoisonError::into_inner);
            let again = flags.get_mut(repo).is_some_and(|f| std::mem::take(&mut f.again));
            if !again {
                flags.remove(repo);
                guard.armed = false;
                return result;
            }
            if let Err(e) = result {
                warn!(repository = %repo, error = %e, "advance failed, re-evaluating for a queued trigger");
            }
        }
    }

    async fn advance_head(&self, repo: &RepositoryId) -> Result<()> {
        let settings = self.settings(repo)?;
        loop {
            let Some(head) = self.store.head(repo).await else {
                return Ok(());
            };
            let cr = head.change_request_id();
            let (summary, required) = self.check_state(settings, &cr).await;
            let step = plan_head(&head, &summary, &required);
            debug!(repository = %repo, entry = %head.id, change_request = head.change_request, %step, "head step");

            match step {
                HeadStep::Idle => return Ok(()),
                HeadStep::Cancel => {
                    let entry = self.store.dequeue(head.id).await?;
                    info!(entry = %entry.id, change_request = entry.change_request, "deferred cancellation applied");
                    self.publish_entry(&entry);
                }
                HeadStep::Fail { reason } => {
                    let ci = ci_status(&summary, &required);
                    let result = self
                        .store
                        .transition(head.id, &WAITING, QueueStatus::Failed, |e| {
                            e.failure = Some(reason);
                            e.ci_status = ci;
                        })
                        .await;
                    if let Some(entry) = raced(result)? {
                        self.publish_entry(&entry);
                    }
                }
                HeadStep::Wait { .. } => {
                    let ci = ci_status(&summary, &required);
                    if head.status != QueueStatus::RunningCi || head.ci_status != ci {
                        let result = self
                            .store
                            .transition(head.id, &WAITING, QueueStatus::RunningCi, |e| e.ci_status = ci)
                            .await;
                        if let Some(entry) = raced(result)? {
                            self.publish_entry(&entry);
                        }
                    }
                    return Ok(());
                }
                HeadStep::MarkReady => {
                    let result = self
                        .store
                        .transition(
                            head.id,
                            &[QueueStatus::Pending, QueueStatus::RunningCi],
                            QueueStatus::Ready,
                            |e| e.ci_status = CiStatus::Passing,
                        )
                        .await;
                    if let Some(entry) = raced(result)? {
                        self.publish_entry(&entry);
                    }
                }
                HeadStep::Merge => self.merge_head(settings, head).await?,
            }
        }
    }

    /// Detect conflicts for the ready head entry and integrate it if clean
    async fn merge_head(&self, settings: &RepositorySettings, head: QueueEntry) -> Result<()> {
        let cr = head.change_request_id();
        let change = match self.platform.get_change_request(&cr).await {
            Ok(change) => change,
            Err(e) => {
                warn!(change_request = %cr, error = %e, "could not load change request for merge");
                return self.fail_waiting(head.id, FailureReason::Error { message: e.to_string() }).await;
            }
        };

        if !change.is_open() {
            info!(change_request = %cr, state = %change.state, "change request no longer open, cancelling");
            let entry = self.store.dequeue(head.id).await?;
            self.publish_entry(&entry);
            return Ok(());
        }

        if head.head_sha.as_deref() != Some(change.head_sha.as_str()) {
            info!(change_request = %cr, sha = %change.head_sha, "head commit moved, re-evaluating checks");
            self.checks.set_head(&cr, &change.head_sha).await;
            self.backfill(settings, &cr, &change.head_sha).await;
            self.persist_checks().await;
            let sha = change.head_sha.clone();
            let entry = self.store.update(head.id, |e| e.head_sha = Some(sha)).await?;
            self.publish_entry(&entry);
            return Ok(());
        }

        let target = merge_target(settings, &head, &change);
        let report = match self.conflicts.check_conflicts(&target).await {
            Ok(report) => report,
            Err(e) => {
                warn!(change_request = %cr, error = %e, "conflict detection failed");
                return self.fail_waiting(head.id, FailureReason::Error { message: e.to_string() }).await;
            }
        };

        if !report.is_clean() {
            let paths = report.paths();
            let record = report.record();
            info!(change_request = %cr, files = paths.len(), "conflicts detected, awaiting resolution");
            let failure_paths = paths.clone();
            let result = self
                .store
                .transition(head.id, &[QueueStatus::Ready], QueueStatus::Failed, |e| {
                    e.failure = Some(FailureReason::Conflicts { paths: failure_paths });
                    e.resolvable = true;
                    e.conflict = Some(record);
                })
                .await;
            if let Some(entry) = raced(result)? {
                self.publish_entry(&entry);
                self.events.publish(&QueueEvent::ConflictsDetected {
                    repository: entry.repository.clone(),
                    entry: entry.id,
                    paths,
                });
            }
            return Ok(());
        }

        let result = self
            .store
            .transition(head.id, &[QueueStatus::Ready], QueueStatus::Merging, |e| {
                e.merging_started_at = Some(Utc::now());
            })
            .await;
        let Some(merging) = raced(result)? else {
            return Ok(());
        };
        self.publish_entry(&merging);

        let outcome = tokio::time::timeout(self.merge_timeout, self.conflicts.merge_clean(&target)).await;
        self.finish_merge(merging.id, outcome).await
    }

    async fn finish_merge(
        &self,
        id: EntryId,
        outcome: std::result::Result<Result<String>, tokio::time::error::Elapsed>,
    ) -> Result<()> {
        let cancel_requested = self.store.get(id).await?.cancel_requested;

        let mut conflict = None;
        let (status, failure, merge_sha) = match outcome {
            Ok(Ok(sha)) => (QueueStatus::Merged, None, Some(sha)),
            Ok(Err(Error::MergeConflict { base_sha, paths })) => {
                conflict = Some(ConflictRecord {
                    base_sha,
                    paths: paths.clone(),
                });
                (QueueStatus::Failed, Some(FailureReason::Conflicts { paths }), None)
            }
            Ok(Err(Error::PushRejected(message))) => (
                QueueStatus::Failed,
                Some(FailureReason::PushRejected { message }),
                None,
            ),
            Ok(Err(e)) => (
                QueueStatus::Failed,
                Some(FailureReason::Error { message: e.to_string() }),
                None,
            ),
            Err(_) => {
                warn!(entry = %id, timeout = ?self.merge_timeout, "merge timed out");
                (QueueStatus::Failed, Some(FailureReason::Timeout), None)
            }
        };
        let status = if cancel_requested && status != QueueStatus::Merged {
            QueueStatus::Cancelled
        } else {
            status
        };

        let result = self
            .store
            .transition(id, &[QueueStatus::Merging], status, |e| {
                e.failure = failure;
                e.merge_sha = merge_sha;
                if status == QueueStatus::Failed {
                    e.resolvable = conflict.is_some();
                    e.conflict = conflict;
                } else {
                    e.resolvable = false;
                    e.conflict = None;
                }
            })
            .await;
        if let Some(entry) = raced(result)? {
            match &entry.failure {
                Some(reason) => info!(entry = %entry.id, status = %entry.status, %reason, "merge finished"),
                None => info!(entry = %entry.id, status = %entry.status, sha = ?entry.merge_sha, "merge finished"),
            }
            self.publish_entry(&entry);
        }
        Ok(())
    }

    async fn fail_waiting(&self, id: EntryId, reason: FailureReason) -> Result<()> {
        let result = self
            .store
            .transition(id, &WAITING, QueueStatus::Failed, |e| e.failure = Some(reason))
            .await;
        if let Some(entry) = raced(result)? {
            self.publish_entry(&entry);
        }
        Ok(())
    }

    // ---- removal ----

    /// Cancel an entry.
    ///
    /// Entries in `merging` hold the workspace; their cancellation is
    /// deferred until the merge finishes. Cancelling a terminal entry returns
    /// it unchanged.
    pub async fn cancel(&self, id: EntryId) -> Result<CancelOutcome> {
        let entry = self.store.get(id).await?;
        if entry.status != QueueStatus::Merging {
            match self.store.dequeue(id).await {
                Ok(entry) => {
                    if entry.status == QueueStatus::Cancelled {
                        self.publish_entry(&entry);
                    }
                    self.advance(&entry.repository).await?;
                    return Ok(CancelOutcome::Cancelled(entry));
                }
                // Started merging in the meantime
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let entry = self.store.update(id, |e| e.cancel_requested = true).await?;
        info!(entry = %id, "entry is merging, cancellation deferred");
        self.publish_entry(&entry);
        Ok(CancelOutcome::Deferred(entry))
    }

    /// Cancel the active entry of a change request that was closed upstream
    pub async fn handle_change_closed(&self, cr: &ChangeRequestId) -> Result<Option<CancelOutcome>> {
        self.settings(&cr.repository)?;
        let Some(entry) = self.store.active_for_change(cr).await else {
            return Ok(None);
        };
        info!(change_request = %cr, entry = %entry.id, "change request closed, cancelling entry");
        self.cancel(entry.id).await.map(Some)
    }

    // ---- conflicts ----

    /// Run conflict detection for an entry.
    ///
    /// For an entry awaiting resolution, the stored base commit and conflict
    /// set are refreshed so a later resolution is checked against them.
    pub async fn check_conflicts(&self, id: EntryId) -> Result<ConflictReport> {
        let entry = self.store.get(id).await?;
        let settings = self.settings(&entry.repository)?;
        let change = self.platform.get_change_request(&entry.change_request_id()).await?;
        let report = self
            .conflicts
            .check_conflicts(&merge_target(settings, &entry, &change))
            .await?;

        if entry.status == QueueStatus::Failed && entry.resolvable {
            let record = report.record();
            let paths = report.paths();
            self.store
                .update(id, |e| {
                    if !paths.is_empty() {
                        e.failure = Some(FailureReason::Conflicts { paths });
                    }
                    e.conflict = Some(record);
                })
                .await?;
        }
        Ok(report)
    }

    /// Apply human resolutions to an entry parked with conflicts.
    ///
    /// On success the entry becomes `merged`. If the base branch moved, the
    /// entry loses its resolvable flag, the change is re-queued for a fresh
    /// detection, and [`Error::ConcurrentBaseUpdate`] is returned. Incomplete
    /// resolutions leave the entry untouched.
    pub async fn resolve_conflicts(&self, id: EntryId, resolutions: &[Resolution]) -> Result<QueueEntry> {
        let entry = self.store.get(id).await?;
        if entry.status != QueueStatus::Failed || !entry.resolvable {
            return Err(Error::NotResolvable(id));
        }
        // Resolution is only checked against a recorded detection
        let Some(recorded) = entry.conflict.as_ref() else {
            return Err(Error::NotResolvable(id));
        };
        let settings = self.settings(&entry.repository)?;
        let cr = entry.change_request_id();
        let change = self.platform.get_change_request(&cr).await?;
        if !change.is_open() {
            return Err(Error::ChangeRequestClosed(cr));
        }

        let target = merge_target(settings, &entry, &change);
        match self
            .conflicts
            .resolve_conflicts(&target, resolutions, Some(recorded))
            .await
        {
            Ok(sha) => {
                let merged = self
                    .store
                    .transition(id, &[QueueStatus::Failed], QueueStatus::Merged, |e| {
                        e.merge_sha = Some(sha);
                        e.failure = None;
                        e.resolvable = false;
                        e.conflict = None;
                    })
                    .await?;
                info!(entry = %id, change_request = %cr, "conflicts resolved and merged");
                self.publish_entry(&merged);
                self.advance(&entry.repository).await?;
                Ok(merged)
            }
            Err(Error::ConcurrentBaseUpdate(base)) => {
                warn!(entry = %id, change_request = %cr, "base moved during resolution, re-queueing");
                let failed = self
                    .store
                    .update(id, |e| {
                        e.failure = Some(FailureReason::ConcurrentBaseUpdate);
                        e.resolvable = false;
                    })
                    .await?;
                self.publish_entry(&failed);

                let request = AdmitRequest {
                    change_request: cr.clone(),
                    priority: entry.priority,
                    merge_method: entry.merge_method,
                    stack: entry.stack.clone(),
                    added_by: entry.added_by.clone(),
                };
                match self.enqueue(request).await {
                    Ok(requeued) => info!(change_request = %cr, entry = %requeued.id, "re-queued after base update"),
                    Err(Error::AlreadyQueued { .. }) => {}
                    Err(e) => warn!(change_request = %cr, error = %e, "could not re-queue change request"),
                }
                Err(Error::ConcurrentBaseUpdate(base))
            }
            Err(e) => Err(e),
        }
    }

    // ---- ordering ----

    /// Replace a repository's queue order and re-evaluate its head
    pub async fn reorder(&self, repo: &RepositoryId, ordered: &[EntryId]) -> Result<Vec<QueueEntry>> {
        self.settings(repo)?;
        let entries = self.store.reorder(repo, ordered).await?;
        self.events.publish(&QueueEvent::QueueReordered {
            repository: repo.clone(),
            order: entries.iter().map(|e| e.id).collect(),
        });
        self.advance(repo).await?;
        Ok(self.store.active(repo).await)
    }

    // ---- maintenance ----

    /// Fail entries stuck in `merging` past the deadline and drop dead event
    /// subscribers
    pub async fn sweep(&self) -> Result<SweepReport> {
        let limit = chrono::Duration::from_std(self.merge_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();
        let mut report = SweepReport::default();

        for repo in self.repositories() {
            let stuck: Vec<EntryId> = self
                .store
                .active(&repo)
                .await
                .into_iter()
                .filter(|e| {
                    e.status == QueueStatus::Merging
                        && e.merging_started_at.is_some_and(|t| now - t > limit)
                })
                .map(|e| e.id)
                .collect();
            if stuck.is_empty() {
                continue;
            }
            for id in stuck {
                let result = self
                    .store
                    .transition(id, &[QueueStatus::Merging], QueueStatus::Failed, |e| {
                        e.failure = Some(FailureReason::Timeout);
                    })
                    .await;
                if let Some(entry) = raced(result)? {
                    warn!(entry = %id, "entry stuck in merging, failed by sweep");
                    self.publish_entry(&entry);
                    report.timed_out.push(id);
                }
            }
            self.advance(&repo).await?;
        }

        report.subscribers = self.events.sweep(SUBSCRIBER_STALL_LIMIT);
        Ok(report)
    }

    /// Announce entries interrupted by a restart and re-evaluate every
    /// configured repository
    pub async fn recover(&self, interrupted: &[QueueEntry]) {
        for entry in interrupted {
            self.publish_entry(entry);
        }
        for repo in self.repositories() {
            if let Err(e) = self.advance(&repo).await {
                warn!(repository = %repo, error = %e, "re-evaluation after restart failed");
            }
        }
    }

    // ---- queries ----

    /// Active entries in queue order
    pub async fn list(&self, repo: &RepositoryId) -> Result<Vec<QueueEntry>> {
        self.settings(repo)?;
        Ok(self.store.active(repo).await)
    }

    /// Active entries joined with change request metadata.
    ///
    /// Lookups that fail leave the metadata empty.
    pub async fn list_with_metadata(&self, repo: &RepositoryId) -> Result<Vec<QueueItem>> {
        let entries = self.list(repo).await?;
        let lookups = entries
            .iter()
            .map(|e| async move { self.platform.get_change_request(&e.change_request_id()).await });
        let changes = join_all(lookups).await;

        Ok(entries
            .into_iter()
            .zip(changes)
            .map(|(entry, change)| {
                let change: Option<ChangeRequest> = change
                    .inspect_err(|e| debug!(entry = %entry.id, error = %e, "metadata lookup failed"))
                    .ok();
                QueueItem {
                    title: change.as_ref().map(|c| c.title.clone()),
                    author: change.as_ref().map(|c| c.author.clone()),
                    html_url: change.map(|c| c.html_url),
                    entry,
                }
            })
            .collect())
    }

    /// Terminal entries, oldest first
    pub async fn history(&self, repo: &RepositoryId) -> Result<Vec<QueueEntry>> {
        self.settings(repo)?;
        Ok(self.store.history(repo).await)
    }

    /// Look up an entry
    pub async fn get(&self, id: EntryId) -> Result<QueueEntry> {
        self.store.get(id).await
    }

    /// Check state of a change request
    pub async fn check_status(&self, cr: &ChangeRequestId) -> Result<CheckStatusReport> {
        let settings = self.settings(&cr.repository)?;
        let (summary, required) = self.check_state(settings, cr).await;
        Ok(CheckStatusReport {
            summary,
            required,
            mergeable: self.checks.mergeable_state(cr).await,
            runs: self.checks.check_runs(cr).await,
        })
    }
}

fn merge_target(settings: &RepositorySettings, entry: &QueueEntry, change: &ChangeRequest) -> MergeTarget {
    MergeTarget {
        repository: entry.repository.clone(),
        number: entry.change_request,
        title: change.title.clone(),
        head_ref: change.head_ref.clone(),
        base_branch: settings.base_branch.clone(),
        method: entry.merge_method,
    }
}

/// `None` when the entry moved on concurrently and the step must be re-planned
fn raced(result: Result<QueueEntry>) -> Result<Option<QueueEntry>> {
    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(Error::InvalidTransition { entry, from, to }) => {
            debug!(%entry, %from, %to, "entry changed concurrently, skipping");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
