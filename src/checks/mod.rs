//! Check aggregation
//!
//! Ingests check-run updates from CI systems and derives a per-change
//! mergeable state. Ingestion is idempotent on `(change request, name, head
//! sha)` and tolerates duplicated or out-of-order deliveries.

mod mapping;

pub use mapping::{map_conclusion, map_status};

use crate::types::{ChangeRequestId, MergeableState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Lifecycle status of a check run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Waiting to start
    Queued,
    /// Running
    InProgress,
    /// Finished (see conclusion)
    Completed,
}

/// Outcome of a completed check run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    /// Passed
    Success,
    /// Failed
    Failure,
    /// Neither pass nor fail
    Neutral,
    /// Cancelled before finishing
    Cancelled,
    /// Ran out of time
    TimedOut,
    /// Needs manual action
    ActionRequired,
}

impl CheckConclusion {
    /// Whether this conclusion counts as a failure
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Failure | Self::Cancelled | Self::TimedOut | Self::ActionRequired
        )
    }
}

/// Free-form output attached to a check run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckOutput {
    /// Short title
    pub title: Option<String>,
    /// Longer summary
    pub summary: Option<String>,
}

/// A typed check-run update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunInput {
    /// Check name, unique per change request and head commit
    pub name: String,
    /// Commit the check ran against
    pub head_sha: String,
    /// Lifecycle status
    pub status: CheckStatus,
    /// Conclusion (only meaningful once completed)
    pub conclusion: Option<CheckConclusion>,
    /// Link to the CI run
    pub details_url: Option<String>,
    /// Output summary
    pub output: Option<CheckOutput>,
}

/// A check-run update as posted by an external CI system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCheckRun {
    /// Check name
    pub name: String,
    /// Commit the check ran against
    pub head_sha: String,
    /// Raw status string
    pub status: String,
    /// Raw conclusion string
    #[serde(default)]
    pub conclusion: Option<String>,
    /// Link to the CI run
    #[serde(default)]
    pub details_url: Option<String>,
    /// Output summary
    #[serde(default)]
    pub output: Option<CheckOutput>,
}

impl ExternalCheckRun {
    /// Map raw strings into the typed model
    pub fn into_input(self) -> CheckRunInput {
        let status = map_status(&self.status);
        let conclusion = if status == CheckStatus::Completed {
            // Providers that report the conclusion as the status
            // (`"status": "success"`) are covered by the fallback
            self.conclusion
                .as_deref()
                .or(Some(self.status.as_str()).filter(|s| *s != "completed"))
                .and_then(map_conclusion)
        } else {
            None
        };
        CheckRunInput {
            name: self.name,
            head_sha: self.head_sha,
            status,
            conclusion,
            details_url: self.details_url,
            output: self.output,
        }
    }
}

/// A recorded check run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    /// Change request the check belongs to
    pub change_request: ChangeRequestId,
    /// Check name
    pub name: String,
    /// Commit the check ran against
    pub head_sha: String,
    /// Lifecycle status
    pub status: CheckStatus,
    /// `None` unless completed with a mapped conclusion
    pub conclusion: Option<CheckConclusion>,
    /// Link to the CI run
    pub details_url: Option<String>,
    /// Output summary
    pub output: Option<CheckOutput>,
    /// Last time this record changed
    pub updated_at: DateTime<Utc>,
    /// When the run completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl CheckRun {
    /// Completed with a passing conclusion
    pub fn is_success(&self) -> bool {
        self.status == CheckStatus::Completed && self.conclusion == Some(CheckConclusion::Success)
    }

    /// Completed with a failing conclusion
    pub fn is_failure(&self) -> bool {
        self.status == CheckStatus::Completed && self.conclusion.is_some_and(CheckConclusion::is_failure)
    }

    /// Completed as neutral
    pub fn is_neutral(&self) -> bool {
        self.status == CheckStatus::Completed && self.conclusion == Some(CheckConclusion::Neutral)
    }

    /// Not completed, or completed without a mapped conclusion
    pub fn is_pending(&self) -> bool {
        self.status != CheckStatus::Completed || self.conclusion.is_none()
    }
}

/// Counts over the current check runs of a change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckSummary {
    /// All runs
    pub total: usize,
    /// Completed with success
    pub passed: usize,
    /// Completed with a failing conclusion
    pub failed: usize,
    /// Still running or unresolved
    pub pending: usize,
    /// Completed as neutral
    pub neutral: usize,
    /// `failed == 0 && pending == 0`
    pub all_passing: bool,
}

/// Result of checking required check names
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequiredChecks {
    /// Every required check completed with success
    pub passing: bool,
    /// Required checks never reported
    pub missing: Vec<String>,
    /// Required checks present but not (completed, success)
    pub failing: Vec<String>,
}

/// Outcome of an upsert
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// The stored run after the update
    pub run: CheckRun,
    /// Whether the stored run is completed (re-evaluation trigger)
    pub completed: bool,
    /// Whether anything changed
    pub changed: bool,
}

/// Persistable state of the aggregator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckSnapshot {
    /// All recorded runs
    #[serde(default)]
    pub runs: Vec<CheckRun>,
    /// Known head commits
    #[serde(default)]
    pub heads: Vec<HeadRecord>,
    /// Commits replaced by a later push
    #[serde(default)]
    pub superseded: Vec<HeadRecord>,
    /// Last derived mergeable states
    #[serde(default)]
    pub mergeable: Vec<MergeableRecord>,
}

/// Head commit of a change request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadRecord {
    /// Change request
    pub change_request: ChangeRequestId,
    /// Head SHA
    pub sha: String,
}

/// Persisted mergeable state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeableRecord {
    /// Change request
    pub change_request: ChangeRequestId,
    /// Derived state
    pub state: MergeableState,
}

/// `(change request, check name, head sha)`
type RunKey = (ChangeRequestId, String, String);

#[derive(Debug, Default)]
struct CheckBook {
    runs: BTreeMap<RunKey, CheckRun>,
    heads: HashMap<ChangeRequestId, String>,
    superseded: HashMap<ChangeRequestId, HashSet<String>>,
    mergeable: HashMap<ChangeRequestId, MergeableState>,
}

impl CheckBook {
    fn runs_of<'a>(&'a self, cr: &'a ChangeRequestId) -> impl Iterator<Item = &'a CheckRun> {
        self.runs
            .range((cr.clone(), String::new(), String::new())..)
            .take_while(move |((id, _, _), _)| id == cr)
            .map(|(_, run)| run)
    }

    /// Runs for the change request's current head, ordered by name.
    ///
    /// With the head unknown, the most recently updated run of each name.
    fn current_runs<'a>(&'a self, cr: &'a ChangeRequestId) -> Vec<&'a CheckRun> {
        if let Some(head) = self.heads.get(cr) {
            return self.runs_of(cr).filter(|run| run.head_sha == *head).collect();
        }
        let mut latest: BTreeMap<&str, &CheckRun> = BTreeMap::new();
        for run in self.runs_of(cr) {
            match latest.get(run.name.as_str()) {
                Some(seen) if seen.updated_at >= run.updated_at => {}
                _ => {
                    latest.insert(run.name.as_str(), run);
                }
            }
        }
        latest.into_values().collect()
    }

    fn is_superseded(&self, cr: &ChangeRequestId, sha: &str) -> bool {
        self.superseded.get(cr).is_some_and(|shas| shas.contains(sha))
    }
}

fn new_run(
    cr: &ChangeRequestId,
    input: CheckRunInput,
    conclusion: Option<CheckConclusion>,
    now: DateTime<Utc>,
) -> CheckRun {
    CheckRun {
        change_request: cr.clone(),
        completed_at: (input.status == CheckStatus::Completed).then_some(now),
        name: input.name,
        head_sha: input.head_sha,
        status: input.status,
        conclusion,
        details_url: input.details_url,
        output: input.output,
        updated_at: now,
    }
}

/// Check aggregator
#[derive(Debug, Default)]
pub struct CheckAggregator {
    book: RwLock<CheckBook>,
}

impl CheckAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an aggregator from a snapshot
    pub fn from_snapshot(snapshot: CheckSnapshot) -> Self {
        let mut book = CheckBook::default();
        for run in snapshot.runs {
            let key = (run.change_request.clone(), run.name.clone(), run.head_sha.clone());
            book.runs.insert(key, run);
        }
        for head in snapshot.heads {
            book.heads.insert(head.change_request, head.sha);
        }
        for old in snapshot.superseded {
            book.superseded
                .entry(old.change_request)
                .or_default()
                .insert(old.sha);
        }
        for record in snapshot.mergeable {
            book.mergeable.insert(record.change_request, record.state);
        }
        Self {
            book: RwLock::new(book),
        }
    }

    /// Export the current state
    pub async fn snapshot(&self) -> CheckSnapshot {
        let book = self.book.read().await;
        CheckSnapshot {
            runs: book.runs.values().cloned().collect(),
            heads: book
                .heads
                .iter()
                .map(|(cr, sha)| HeadRecord {
                    change_request: cr.clone(),
                    sha: sha.clone(),
                })
                .collect(),
            superseded: book
                .superseded
                .iter()
                .flat_map(|(cr, shas)| {
                    shas.iter().map(|sha| HeadRecord {
                        change_request: cr.clone(),
                        sha: sha.clone(),
                    })
                })
                .collect(),
            mergeable: book
                .mergeable
                .iter()
                .map(|(cr, state)| MergeableRecord {
                    change_request: cr.clone(),
                    state: *state,
                })
                .collect(),
        }
    }

    /// Record the change request's current head commit.
    ///
    /// The previous head becomes superseded: its runs are dropped and later
    /// updates for it are ignored.
    pub async fn set_head(&self, cr: &ChangeRequestId, sha: &str) {
        let mut book = self.book.write().await;
        let previous = book.heads.insert(cr.clone(), sha.to_string());
        if previous.as_deref() == Some(sha) {
            return;
        }
        debug!(change_request = %cr, sha, previous = ?previous, "head commit changed");

        let superseded = book.superseded.entry(cr.clone()).or_default();
        if let Some(previous) = previous {
            superseded.insert(previous);
        }
        superseded.remove(sha);
        let superseded = superseded.clone();
        book.runs
            .retain(|(id, _, run_sha), _| id != cr || !superseded.contains(run_sha));
    }

    /// Recorded head commit of a change request
    pub async fn head(&self, cr: &ChangeRequestId) -> Option<String> {
        self.book.read().await.heads.get(cr).cloned()
    }

    /// Whether `sha` is neither the recorded head nor a superseded commit.
    ///
    /// `false` while no head is recorded.
    pub async fn is_unrecognized_commit(&self, cr: &ChangeRequestId, sha: &str) -> bool {
        let book = self.book.read().await;
        book.heads.get(cr).is_some_and(|head| head != sha) && !book.is_superseded(cr, sha)
    }

    /// Insert or update a check run keyed by `(change request, name, head sha)`.
    ///
    /// Updates for a superseded commit, and updates that would move a
    /// completed run back to running, are ignored.
    pub async fn upsert_check_run(&self, cr: &ChangeRequestId, input: CheckRunInput) -> UpsertOutcome {
        let mut book = self.book.write().await;
        let now = Utc::now();

        // A conclusion without completion violates the run invariant
        let conclusion = if input.status == CheckStatus::Completed {
            input.conclusion
        } else {
            None
        };

        if book.is_superseded(cr, &input.head_sha) {
            debug!(
                change_request = %cr,
                check = %input.name,
                sha = %input.head_sha,
                "ignoring update for superseded commit"
            );
            let current = book
                .heads
                .get(cr)
                .and_then(|head| book.runs.get(&(cr.clone(), input.name.clone(), head.clone())))
                .cloned();
            return UpsertOutcome {
                run: current.unwrap_or_else(|| new_run(cr, input, conclusion, now)),
                completed: false,
                changed: false,
            };
        }

        let key = (cr.clone(), input.name.clone(), input.head_sha.clone());
        if let Some(existing) = book.runs.get(&key) {
            if existing.status == CheckStatus::Completed && input.status != CheckStatus::Completed {
                debug!(change_request = %cr, check = %input.name, "ignoring late update for completed run");
                return UpsertOutcome {
                    completed: true,
                    run: existing.clone(),
                    changed: false,
                };
            }

            let unchanged = existing.status == input.status
                && existing.conclusion == conclusion
                && existing.details_url == input.details_url
                && existing.output == input.output;
            if unchanged {
                return UpsertOutcome {
                    completed: existing.status == CheckStatus::Completed,
                    run: existing.clone(),
                    changed: false,
                };
            }
        }

        let run = new_run(cr, input, conclusion, now);
        debug!(
            change_request = %cr,
            check = %run.name,
            sha = %run.head_sha,
            status = ?run.status,
            conclusion = ?run.conclusion,
            "recorded check run"
        );
        book.runs.insert(key, run.clone());

        UpsertOutcome {
            completed: run.status == CheckStatus::Completed,
            run,
            changed: true,
        }
    }

    /// Current runs of a change request
    pub async fn check_runs(&self, cr: &ChangeRequestId) -> Vec<CheckRun> {
        let book = self.book.read().await;
        book.current_runs(cr).into_iter().cloned().collect()
    }

    /// Summarize the current runs of a change request
    pub async fn get_summary(&self, cr: &ChangeRequestId) -> CheckSummary {
        let book = self.book.read().await;
        summarize(book.current_runs(cr))
    }

    /// Check required check names against the current runs
    pub async fn are_required_passing(&self, cr: &ChangeRequestId, required: &[String]) -> RequiredChecks {
        let book = self.book.read().await;
        required_passing(book.current_runs(cr), required)
    }

    /// Derive and store the mergeable state of a change request
    pub async fn update_mergeable_state(
        &self,
        cr: &ChangeRequestId,
        required: &[String],
    ) -> MergeableState {
        let mut book = self.book.write().await;
        let summary = summarize(book.current_runs(cr));
        let required = required_passing(book.current_runs(cr), required);
        let state = derive_mergeable_state(&summary, &required);
        let previous = book.mergeable.insert(cr.clone(), state);
        if previous != Some(state) {
            debug!(change_request = %cr, %state, "mergeable state updated");
        }
        state
    }

    /// Last derived mergeable state (`Unknown` if never derived)
    pub async fn mergeable_state(&self, cr: &ChangeRequestId) -> MergeableState {
        let book = self.book.read().await;
        book.mergeable.get(cr).copied().unwrap_or_default()
    }
}

fn summarize<'a>(runs: impl IntoIterator<Item = &'a CheckRun>) -> CheckSummary {
    let mut summary = CheckSummary::default();
    for run in runs {
        summary.total += 1;
        if run.is_pending() {
            summary.pending += 1;
        } else if run.is_success() {
            summary.passed += 1;
        } else if run.is_neutral() {
            summary.neutral += 1;
        } else {
            summary.failed += 1;
        }
    }
    summary.all_passing = summary.failed == 0 && summary.pending == 0;
    summary
}

fn required_passing<'a>(runs: impl IntoIterator<Item = &'a CheckRun>, required: &[String]) -> RequiredChecks {
    let by_name: HashMap<&str, &CheckRun> = runs.into_iter().map(|r| (r.name.as_str(), r)).collect();
    let mut result = RequiredChecks::default();
    for name in required {
        match by_name.get(name.as_str()) {
            None => result.missing.push(name.clone()),
            Some(run) if !run.is_success() => result.failing.push(name.clone()),
            Some(_) => {}
        }
    }
    result.passing = result.missing.is_empty() && result.failing.is_empty();
    result
}

/// Derive the mergeable state from a summary and the required-check result.
///
/// Pending work wins over failures so a re-run is not reported as blocked
/// before it completes.
pub fn derive_mergeable_state(summary: &CheckSummary, required: &RequiredChecks) -> MergeableState {
    if summary.pending > 0 {
        MergeableState::Unknown
    } else if summary.failed > 0 || !required.failing.is_empty() {
        MergeableState::Blocked
    } else if required.passing {
        MergeableState::Clean
    } else {
        MergeableState::Unknown
    }
}
