//! Core types for mergeq

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

/// A repository on the hosting platform (`owner/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryId {
    /// Repository owner (user or organization)
    pub owner: String,
    /// Repository name
    pub name: String,
}

impl RepositoryId {
    /// Create a repository ID from its parts
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositoryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(format!("expected owner/name, got '{s}'")),
        }
    }
}

impl TryFrom<String> for RepositoryId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RepositoryId> for String {
    fn from(id: RepositoryId) -> Self {
        id.to_string()
    }
}

/// A change request (PR) within a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeRequestId {
    /// Repository the change request belongs to
    pub repository: RepositoryId,
    /// PR number
    pub number: u64,
}

impl ChangeRequestId {
    /// Create a change request ID
    pub const fn new(repository: RepositoryId, number: u64) -> Self {
        Self { repository, number }
    }
}

impl std::fmt::Display for ChangeRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

/// Opaque queue entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generate a fresh entry ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier grouping entries that must merge in dependency order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(pub String);

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Membership of a queue entry in a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMembership {
    /// The stack this entry belongs to
    pub id: StackId,
    /// Distance from the base of the stack (0 = base-most change)
    pub depth: u32,
}

/// Lifecycle status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Admitted, not yet classified
    Pending,
    /// Waiting for outstanding checks
    RunningCi,
    /// Checks passed, waiting for its turn
    Ready,
    /// Merge in flight (workspace lock held)
    Merging,
    /// Integrated into the base branch
    Merged,
    /// Could not be merged
    Failed,
    /// Removed before merging
    Cancelled,
}

impl QueueStatus {
    /// Terminal statuses are history and never change again (except a
    /// resolvable failure finishing as merged)
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Cancelled)
    }

    /// Active entries occupy a queue position
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::RunningCi => write!(f, "running_ci"),
            Self::Ready => write!(f, "ready"),
            Self::Merging => write!(f, "merging"),
            Self::Merged => write!(f, "merged"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Mirror of the aggregated check state on a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    /// Checks outstanding (or none reported yet)
    #[default]
    Pending,
    /// All checks passed
    Passing,
    /// At least one check failed
    Failing,
}

impl std::fmt::Display for CiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Passing => write!(f, "passing"),
            Self::Failing => write!(f, "failing"),
        }
    }
}

/// Merge strategy/method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Create a merge commit
    #[default]
    Merge,
    /// Squash all commits into one
    Squash,
    /// Rebase commits onto base branch
    Rebase,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Squash => write!(f, "squash"),
            Self::Merge => write!(f, "merge"),
            Self::Rebase => write!(f, "rebase"),
        }
    }
}

impl FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            other => Err(format!("unknown merge method '{other}'")),
        }
    }
}

/// Derived summary of whether checks currently permit merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeableState {
    /// Checks still pending (or required checks not reported)
    #[default]
    Unknown,
    /// All required checks passed and nothing failed
    Clean,
    /// A check failed and nothing is pending
    Blocked,
}

impl std::fmt::Display for MergeableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Clean => write!(f, "clean"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Why an entry ended up `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Head branch conflicts with the base branch
    Conflicts {
        /// Conflicted paths at detection time
        paths: Vec<String>,
    },
    /// Required checks failed
    ChecksFailed {
        /// Names of the failing checks
        checks: Vec<String>,
    },
    /// The remote refused the push
    PushRejected {
        /// Message reported by the remote
        message: String,
    },
    /// The base branch moved under a resolution
    ConcurrentBaseUpdate,
    /// The merge exceeded its deadline
    Timeout,
    /// The service stopped while the merge was in flight
    Interrupted,
    /// Any other error
    Error {
        /// Error message
        message: String,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflicts { paths } => write!(f, "conflicts in {}", paths.join(", ")),
            Self::ChecksFailed { checks } if checks.is_empty() => write!(f, "checks failed"),
            Self::ChecksFailed { checks } => write!(f, "checks failed: {}", checks.join(", ")),
            Self::PushRejected { message } => write!(f, "push rejected: {message}"),
            Self::ConcurrentBaseUpdate => write!(f, "base branch moved concurrently"),
            Self::Timeout => write!(f, "merge timed out"),
            Self::Interrupted => write!(f, "interrupted by restart"),
            Self::Error { message } => write!(f, "{message}"),
        }
    }
}

/// Conflict detection snapshot kept on an entry between detection and resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Base branch commit the detection merged onto
    pub base_sha: String,
    /// Conflicted paths
    pub paths: Vec<String>,
}

/// The record representing a change request's admission into the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Entry ID
    pub id: EntryId,
    /// Repository the entry is queued in
    pub repository: RepositoryId,
    /// PR number of the queued change request
    pub change_request: u64,
    /// Stack membership, if any
    pub stack: Option<StackMembership>,
    /// Lifecycle status
    pub status: QueueStatus,
    /// Higher merges sooner
    pub priority: i32,
    /// Zero-based rank among active entries (`None` once terminal)
    pub position: Option<usize>,
    /// Mirror of the aggregated check state
    pub ci_status: CiStatus,
    /// Merge method used when integrating
    pub merge_method: MergeMethod,
    /// Who admitted the entry
    pub added_by: String,
    /// When the entry was admitted
    pub added_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Head commit at admission time
    pub head_sha: Option<String>,
    /// Approval count at admission time
    pub approvals_at_admission: u32,
    /// Last failure reason
    pub failure: Option<FailureReason>,
    /// Failed entries awaiting a human conflict resolution
    pub resolvable: bool,
    /// Last conflict detection snapshot
    pub conflict: Option<ConflictRecord>,
    /// Cancellation requested while merging
    pub cancel_requested: bool,
    /// When the entry entered `merging`
    pub merging_started_at: Option<DateTime<Utc>>,
    /// Commit created on the base branch
    pub merge_sha: Option<String>,
}

impl QueueEntry {
    /// Change request ID of this entry
    pub fn change_request_id(&self) -> ChangeRequestId {
        ChangeRequestId::new(self.repository.clone(), self.change_request)
    }

    /// Whether the entry is in a non-terminal status
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Lifecycle state of a change request on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestState {
    /// Open and mergeable in principle
    Open,
    /// Closed without merging
    Closed,
    /// Already merged
    Merged,
}

impl std::fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// An approving review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// Reviewer login
    pub reviewer: String,
    /// Whether the reviewer is a designated code owner
    pub is_code_owner: bool,
}

/// A change request (PR) as seen by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// ID (repository + number)
    pub id: ChangeRequestId,
    /// Title
    pub title: String,
    /// Author login
    pub author: String,
    /// Open / closed / merged
    pub state: ChangeRequestState,
    /// Whether the change request is a draft
    pub is_draft: bool,
    /// Labels
    pub labels: BTreeSet<String>,
    /// Approving reviews
    pub approvals: Vec<Approval>,
    /// Head branch name
    pub head_ref: String,
    /// Head commit SHA
    pub head_sha: String,
    /// Base branch name
    pub base_ref: String,
    /// Last update (push, label, review...)
    pub updated_at: DateTime<Utc>,
    /// Web URL
    pub html_url: String,
}

impl ChangeRequest {
    /// Number of approving reviews
    pub fn approval_count(&self) -> u32 {
        u32::try_from(self.approvals.len()).unwrap_or(u32::MAX)
    }

    /// Whether at least one approval came from a code owner
    pub fn has_code_owner_approval(&self) -> bool {
        self.approvals.iter().any(|a| a.is_code_owner)
    }

    /// Whether the change request is open
    pub fn is_open(&self) -> bool {
        self.state == ChangeRequestState::Open
    }
}
