//! Shared fixtures for mergeq tests

#![allow(dead_code)]

mod git_fixture;
mod mock_platform;
mod mock_workspace;

pub use git_fixture::TempGitRemote;
pub use mock_platform::{ListCheckRunsCall, MockChangeRequestService};
pub use mock_workspace::{MergeCall, MockWorkspace};

use chrono::{Duration as ChronoDuration, Utc};
use mergeq::checks::{CheckAggregator, CheckConclusion, CheckRunInput, CheckStatus};
use mergeq::conflicts::ConflictResolver;
use mergeq::driver::{DriverSettings, MergeQueue, RepositorySettings};
use mergeq::events::EventRegistry;
use mergeq::queue::QueueStore;
use mergeq::types::{
    ChangeRequest, ChangeRequestId, ChangeRequestState, QueueEntry, QueueStatus, RepositoryId,
};
use mergeq::workspace::RepoLocks;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub fn repo() -> RepositoryId {
    RepositoryId::new("acme", "widgets")
}

pub fn cr(number: u64) -> ChangeRequestId {
    ChangeRequestId::new(repo(), number)
}

/// Head commit used by [`change_request`]
pub fn head_sha(number: u64) -> String {
    format!("sha-{number}")
}

/// An open change request on `feat-{number}`, last updated an hour ago
pub fn change_request(number: u64) -> ChangeRequest {
    ChangeRequest {
        id: cr(number),
        title: format!("Change {number}"),
        author: "alice".to_string(),
        state: ChangeRequestState::Open,
        is_draft: false,
        labels: BTreeSet::new(),
        approvals: Vec::new(),
        head_ref: format!("feat-{number}"),
        head_sha: head_sha(number),
        base_ref: "main".to_string(),
        updated_at: Utc::now() - ChronoDuration::hours(1),
        html_url: format!("https://github.com/acme/widgets/pull/{number}"),
    }
}

/// A completed check run against `head_sha(number)`
pub fn completed_check(number: u64, name: &str, conclusion: CheckConclusion) -> CheckRunInput {
    CheckRunInput {
        name: name.to_string(),
        head_sha: head_sha(number),
        status: CheckStatus::Completed,
        conclusion: Some(conclusion),
        details_url: None,
        output: None,
    }
}

/// An in-progress check run against `head_sha(number)`
pub fn running_check(number: u64, name: &str) -> CheckRunInput {
    CheckRunInput {
        name: name.to_string(),
        head_sha: head_sha(number),
        status: CheckStatus::InProgress,
        conclusion: None,
        details_url: None,
        output: None,
    }
}

/// A conflicted file body as git leaves it
pub fn conflicted_content(head_ref: &str) -> String {
    format!("<<<<<<< HEAD\nconst a = 1;\n=======\nconst a = 2;\n>>>>>>> {head_ref}\n")
}

/// A queue driver wired to in-memory collaborators
pub struct Harness {
    pub queue: Arc<MergeQueue>,
    pub platform: Arc<MockChangeRequestService>,
    pub workspace: Arc<MockWorkspace>,
    pub locks: Arc<RepoLocks>,
}

impl Harness {
    /// One repository on `main` with a required `ci` check
    pub fn new() -> Self {
        let mut settings = RepositorySettings::new(repo(), "main");
        settings.required_checks = vec!["ci".to_string()];
        Self::with_settings(settings, Duration::from_secs(5))
    }

    pub fn with_settings(settings: RepositorySettings, merge_timeout: Duration) -> Self {
        Self::with_store(settings, merge_timeout, QueueStore::in_memory())
    }

    pub fn with_store(settings: RepositorySettings, merge_timeout: Duration, store: QueueStore) -> Self {
        let platform = Arc::new(MockChangeRequestService::new());
        let workspace = Arc::new(MockWorkspace::new());
        let locks = Arc::new(RepoLocks::new(Duration::from_secs(2)));
        let resolver = ConflictResolver::new(workspace.clone(), Arc::clone(&locks), "origin");
        let queue = MergeQueue::new(
            store,
            CheckAggregator::new(),
            resolver,
            platform.clone(),
            EventRegistry::new(),
            DriverSettings {
                repositories: vec![settings],
                merge_timeout,
                state_dir: None,
            },
        );
        Self {
            queue: Arc::new(queue),
            platform,
            workspace,
            locks,
        }
    }

    /// Register open change requests for the given numbers
    pub fn with_changes(self, numbers: &[u64]) -> Self {
        for number in numbers {
            self.platform.insert(change_request(*number));
        }
        self
    }

    /// Active entry of a change request, if any
    pub async fn active_entry(&self, number: u64) -> Option<QueueEntry> {
        self.queue
            .list(&repo())
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.change_request == number)
    }

    /// Poll until the change request's active entry reaches `status`
    pub async fn wait_for_status(&self, number: u64, status: QueueStatus) -> QueueEntry {
        for _ in 0..400 {
            if let Some(entry) = self.active_entry(number).await
                && entry.status == status
            {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("#{number} never reached {status}");
    }
}
