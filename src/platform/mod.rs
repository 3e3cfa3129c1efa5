//! Change-request platform services
//!
//! Provides the queue's view of pull requests: metadata, approvals and the
//! check runs already reported for a head commit.

mod factory;
mod github;

pub use factory::create_change_request_service;
pub use github::GitHubService;

use crate::checks::CheckRunInput;
use crate::error::Result;
use crate::types::{Approval, ChangeRequest, ChangeRequestId};
use async_trait::async_trait;

/// Platform service trait for change-request lookups
///
/// The engine only reads from the platform; integration happens through the
/// git workspace.
#[async_trait]
pub trait ChangeRequestService: Send + Sync {
    /// Get a change request including its approvals.
    ///
    /// Fails with `ChangeRequestNotFound` if it does not exist.
    async fn get_change_request(&self, id: &ChangeRequestId) -> Result<ChangeRequest>;

    /// List approving reviews (latest review per reviewer)
    async fn list_approvals(&self, id: &ChangeRequestId) -> Result<Vec<Approval>>;

    /// Check runs already reported for `head_sha`, used to backfill the
    /// aggregator on admission
    async fn list_check_runs(&self, id: &ChangeRequestId, head_sha: &str) -> Result<Vec<CheckRunInput>>;
}
