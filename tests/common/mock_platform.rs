//! Mock change-request service for testing
//!
//! These are test utilities - not all may be used in current tests but are
//! available for future test development.

#![allow(dead_code)]

use async_trait::async_trait;
use mergeq::checks::CheckRunInput;
use mergeq::error::{Error, Result};
use mergeq::platform::ChangeRequestService;
use mergeq::types::{Approval, ChangeRequest, ChangeRequestId, ChangeRequestState};
use std::collections::HashMap;
use std::sync::Mutex;

/// Call record for `list_check_runs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCheckRunsCall {
    pub change_request: ChangeRequestId,
    pub head_sha: String,
}

/// Simple mock change-request service
///
/// Features:
/// - Change requests registered up front and mutable during a test
/// - Check runs per `(change request, head sha)` for admission backfill
/// - Call tracking for verification
/// - Error injection for failure path testing
#[derive(Default)]
pub struct MockChangeRequestService {
    changes: Mutex<HashMap<ChangeRequestId, ChangeRequest>>,
    check_runs: Mutex<HashMap<(ChangeRequestId, String), Vec<CheckRunInput>>>,
    // Call tracking
    get_calls: Mutex<Vec<ChangeRequestId>>,
    list_check_runs_calls: Mutex<Vec<ListCheckRunsCall>>,
    // Error injection
    error_on_get: Mutex<Option<String>>,
    error_on_list_check_runs: Mutex<Option<String>>,
}

impl MockChangeRequestService {
    pub fn new() -> Self {
        Self::default()
    }

    // === Setup ===

    /// Register (or replace) a change request
    pub fn insert(&self, change: ChangeRequest) {
        self.changes
            .lock()
            .unwrap()
            .insert(change.id.clone(), change);
    }

    /// Change the lifecycle state of a registered change request
    pub fn set_state(&self, id: &ChangeRequestId, state: ChangeRequestState) {
        if let Some(change) = self.changes.lock().unwrap().get_mut(id) {
            change.state = state;
        }
    }

    /// Simulate a push to the head branch
    pub fn set_head_sha(&self, id: &ChangeRequestId, sha: &str) {
        if let Some(change) = self.changes.lock().unwrap().get_mut(id) {
            change.head_sha = sha.to_string();
        }
    }

    /// Add an approving review
    pub fn add_approval(&self, id: &ChangeRequestId, reviewer: &str, is_code_owner: bool) {
        if let Some(change) = self.changes.lock().unwrap().get_mut(id) {
            change.approvals.push(Approval {
                reviewer: reviewer.to_string(),
                is_code_owner,
            });
        }
    }

    /// Check runs returned by `list_check_runs` for a head commit
    pub fn set_check_runs(&self, id: &ChangeRequestId, head_sha: &str, runs: Vec<CheckRunInput>) {
        self.check_runs
            .lock()
            .unwrap()
            .insert((id.clone(), head_sha.to_string()), runs);
    }

    // === Error injection ===

    pub fn fail_get(&self, msg: &str) {
        *self.error_on_get.lock().unwrap() = Some(msg.to_string());
    }

    pub fn fail_list_check_runs(&self, msg: &str) {
        *self.error_on_list_check_runs.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_errors(&self) {
        *self.error_on_get.lock().unwrap() = None;
        *self.error_on_list_check_runs.lock().unwrap() = None;
    }

    // === Call tracking ===

    pub fn get_calls(&self) -> Vec<ChangeRequestId> {
        self.get_calls.lock().unwrap().clone()
    }

    pub fn list_check_runs_calls(&self) -> Vec<ListCheckRunsCall> {
        self.list_check_runs_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeRequestService for MockChangeRequestService {
    async fn get_change_request(&self, id: &ChangeRequestId) -> Result<ChangeRequest> {
        self.get_calls.lock().unwrap().push(id.clone());
        if let Some(msg) = self.error_on_get.lock().unwrap().as_ref() {
            return Err(Error::Platform(msg.clone()));
        }
        self.changes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ChangeRequestNotFound(id.clone()))
    }

    async fn list_approvals(&self, id: &ChangeRequestId) -> Result<Vec<Approval>> {
        let change = self.get_change_request(id).await?;
        Ok(change.approvals)
    }

    async fn list_check_runs(&self, id: &ChangeRequestId, head_sha: &str) -> Result<Vec<CheckRunInput>> {
        self.list_check_runs_calls
            .lock()
            .unwrap()
            .push(ListCheckRunsCall {
                change_request: id.clone(),
                head_sha: head_sha.to_string(),
            });
        if let Some(msg) = self.error_on_list_check_runs.lock().unwrap().as_ref() {
            return Err(Error::Platform(msg.clone()));
        }
        Ok(self
            .check_runs
            .lock()
            .unwrap()
            .get(&(id.clone(), head_sha.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
