//! Error types for mergeq

use crate::types::{ChangeRequestId, EntryId, QueueStatus, RepositoryId};
use thiserror::Error;

/// Errors produced by the merge queue engine
#[derive(Debug, Error)]
pub enum Error {
    /// The change request already has an active queue entry
    #[error("change request {change_request} is already queued as entry {entry}")]
    AlreadyQueued {
        /// The change request that was offered again
        change_request: ChangeRequestId,
        /// The entry that is still active
        entry: EntryId,
    },

    /// A reorder request did not name exactly the active entries
    #[error("invalid reorder: {0}")]
    InvalidReorder(String),

    /// A reorder request would move a stack member ahead of its base
    #[error("stack order violation: {0}")]
    StackOrderViolation(String),

    /// The repository workspace could not be acquired in time
    #[error("workspace for {0} is unavailable")]
    WorkspaceUnavailable(RepositoryId),

    /// The head branch does not merge cleanly onto the base
    #[error("merge conflict in {} file(s) against {base_sha}", paths.len())]
    MergeConflict {
        /// Base branch commit the merge was attempted onto
        base_sha: String,
        /// Conflicted paths
        paths: Vec<String>,
    },

    /// Resolutions did not cover every conflicted path
    #[error("incomplete resolution, still conflicted: {}", .0.join(", "))]
    IncompleteResolution(Vec<String>),

    /// The base branch moved while a resolution was being prepared or pushed
    #[error("base branch {0} moved concurrently")]
    ConcurrentBaseUpdate(String),

    /// The remote refused the push for a reason other than a moved base
    #[error("push rejected: {0}")]
    PushRejected(String),

    /// An external CI value had no mapping
    #[error("unknown check {field} value: {value}")]
    CheckMappingUnknown {
        /// Which field was being mapped (`status` or `conclusion`)
        field: &'static str,
        /// The raw value received
        value: String,
    },

    /// No queue entry with this ID
    #[error("queue entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Repository is not configured
    #[error("unknown repository: {0}")]
    UnknownRepository(RepositoryId),

    /// Change request does not exist on the platform
    #[error("change request not found: {0}")]
    ChangeRequestNotFound(ChangeRequestId),

    /// Change request is closed or already merged
    #[error("change request {0} is not open")]
    ChangeRequestClosed(ChangeRequestId),

    /// A queue entry is not in a state that allows the requested transition
    #[error("invalid transition for entry {entry}: {from} -> {to}")]
    InvalidTransition {
        /// Entry being transitioned
        entry: EntryId,
        /// Current status
        from: QueueStatus,
        /// Requested status
        to: QueueStatus,
    },

    /// Entry is not waiting for a conflict resolution
    #[error("entry {0} is not awaiting conflict resolution")]
    NotResolvable(EntryId),

    /// An operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Git command failure
    #[error("git error: {0}")]
    Git(String),

    /// GitHub API error
    #[error("GitHub API error: {0}")]
    GitHubApi(String),

    /// Generic platform error
    #[error("platform error: {0}")]
    Platform(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Persisted state could not be read or written
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<octocrab::Error> for Error {
    fn from(err: octocrab::Error) -> Self {
        Self::GitHubApi(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Platform(err.to_string())
    }
}

impl Error {
    /// Short machine-readable code for API responses
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyQueued { .. } => "already_queued",
            Self::InvalidReorder(_) => "invalid_reorder",
            Self::StackOrderViolation(_) => "stack_order_violation",
            Self::WorkspaceUnavailable(_) => "workspace_unavailable",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::IncompleteResolution(_) => "incomplete_resolution",
            Self::ConcurrentBaseUpdate(_) => "concurrent_base_update",
            Self::PushRejected(_) => "push_rejected",
            Self::CheckMappingUnknown { .. } => "check_mapping_unknown",
            Self::EntryNotFound(_) => "entry_not_found",
            Self::UnknownRepository(_) => "unknown_repository",
            Self::ChangeRequestNotFound(_) => "change_request_not_found",
            Self::ChangeRequestClosed(_) => "change_request_closed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotResolvable(_) => "not_resolvable",
            Self::Timeout(_) => "timeout",
            Self::Git(_) => "git",
            Self::GitHubApi(_) => "github_api",
            Self::Platform(_) => "platform",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for mergeq operations
pub type Result<T> = std::result::Result<T, Error>;
