//! Integration tests for mergeq

#![allow(deprecated)] // cargo_bin is the standard way to test CLI binaries

mod common;

use assert_cmd::Command;
use common::{Harness, conflicted_content, completed_check, cr, repo};
use mergeq::checks::CheckConclusion;
use mergeq::conflicts::Resolution;
use mergeq::driver::{AdmitRequest, CancelOutcome, RepositorySettings};
use mergeq::error::Error;
use mergeq::queue::{QueueStore, storage};
use mergeq::types::{ChangeRequestState, CiStatus, FailureReason, MergeMethod, QueueStatus};
use predicates::prelude::*;
use std::time::Duration;

fn admit(number: u64) -> AdmitRequest {
    AdmitRequest::new(cr(number), "dev")
}

fn resolution(path: &str, content: &str) -> Resolution {
    Resolution {
        path: path.to_string(),
        content: content.to_string(),
    }
}

/// Harness whose repository has no required checks
fn unguarded(merge_timeout: Duration) -> Harness {
    Harness::with_settings(RepositorySettings::new(repo(), "main"), merge_timeout)
}

// =============================================================================
// CLI Tests
// =============================================================================

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Merge queue for pull requests"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_queue_help() {
    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.args(["queue", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("reorder"));
}

#[test]
fn test_conflicts_help() {
    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.args(["conflicts", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("resolve"));
}

#[test]
fn test_invalid_repository_argument() {
    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.args(["queue", "list", "widgets"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("owner/name"));
}

#[test]
fn test_missing_config_file() {
    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.args(["--config", "/nonexistent/mergeq.toml", "serve"]);

    cmd.assert().failure();
}

#[test]
fn test_unreachable_server() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    std::fs::write(&config, "").unwrap();

    let mut cmd = Command::cargo_bin("mergeq").unwrap();
    cmd.env("MERGEQ_CONFIG", &config)
        .args(["--server", "http://127.0.0.1:9", "queue", "list", "acme/widgets"]);

    cmd.assert().failure();
}

// =============================================================================
// Admission and Ordering Tests
// =============================================================================

#[tokio::test]
async fn test_priority_orders_queue() {
    let h = Harness::new().with_changes(&[123, 124]);

    let first = h.queue.enqueue(admit(123)).await.unwrap();
    assert_eq!(first.status, QueueStatus::RunningCi);
    assert_eq!(first.ci_status, CiStatus::Pending);

    let mut urgent = admit(124);
    urgent.priority = 5;
    h.queue.enqueue(urgent).await.unwrap();

    let queue = h.queue.list(&repo()).await.unwrap();
    let order: Vec<u64> = queue.iter().map(|e| e.change_request).collect();
    assert_eq!(order, vec![124, 123]);
    assert_eq!(queue[0].position, Some(0));
    assert_eq!(queue[1].position, Some(1));
    assert!(h.workspace.merges().is_empty());
}

#[tokio::test]
async fn test_positions_stay_dense_after_cancel() {
    let h = Harness::new().with_changes(&[1, 2, 3]);
    h.queue.enqueue(admit(1)).await.unwrap();
    let middle = h.queue.enqueue(admit(2)).await.unwrap();
    h.queue.enqueue(admit(3)).await.unwrap();

    let outcome = h.queue.cancel(middle.id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled(_)));
    assert_eq!(outcome.entry().status, QueueStatus::Cancelled);
    assert_eq!(outcome.entry().position, None);

    let queue = h.queue.list(&repo()).await.unwrap();
    let positions: Vec<Option<usize>> = queue.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![Some(0), Some(1)]);
    assert_eq!(h.queue.history(&repo()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_admission_is_rejected() {
    let h = Harness::new().with_changes(&[1]);
    let entry = h.queue.enqueue(admit(1)).await.unwrap();

    let err = h.queue.enqueue(admit(1)).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyQueued { entry: existing, .. } if existing == entry.id));
}

#[tokio::test]
async fn test_closed_or_unknown_change_is_not_admitted() {
    let h = Harness::new().with_changes(&[1]);
    h.platform.set_state(&cr(1), ChangeRequestState::Closed);

    let err = h.queue.enqueue(admit(1)).await.unwrap_err();
    assert!(matches!(err, Error::ChangeRequestClosed(_)));

    let err = h.queue.enqueue(admit(99)).await.unwrap_err();
    assert!(matches!(err, Error::ChangeRequestNotFound(_)));

    let other = mergeq::types::ChangeRequestId::new(
        mergeq::types::RepositoryId::new("acme", "unknown"),
        1,
    );
    let err = h
        .queue
        .enqueue(AdmitRequest::new(other, "dev"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRepository(_)));
    assert!(h.queue.list(&repo()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_reorder_leaves_state_unchanged() {
    let h = Harness::new().with_changes(&[1, 2, 3]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();
    let b = h.queue.enqueue(admit(2)).await.unwrap();
    h.queue.enqueue(admit(3)).await.unwrap();
    let before = h.queue.list(&repo()).await.unwrap();

    let err = h.queue.reorder(&repo(), &[b.id, a.id]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidReorder(_)));
    assert_eq!(h.queue.list(&repo()).await.unwrap(), before);
}

#[tokio::test]
async fn test_reorder_changes_head() {
    let h = Harness::new().with_changes(&[1, 2]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();
    let b = h.queue.enqueue(admit(2)).await.unwrap();
    let mut events = h.queue.events().register(Some(repo()));

    let queue = h.queue.reorder(&repo(), &[b.id, a.id]).await.unwrap();
    assert_eq!(queue[0].id, b.id);
    assert_eq!(queue[0].position, Some(0));

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind(), "queue_reordered");
}

#[tokio::test]
async fn test_backfilled_checks_classify_on_admission() {
    let h = Harness::new().with_changes(&[1, 2]);
    h.platform.set_check_runs(
        &cr(2),
        "sha-2",
        vec![completed_check(2, "ci", CheckConclusion::Success)],
    );
    h.queue.enqueue(admit(1)).await.unwrap();

    // Not the head, so it stops at ready
    let entry = h.queue.enqueue(admit(2)).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Ready);
    assert_eq!(entry.ci_status, CiStatus::Passing);
    assert_eq!(h.platform.list_check_runs_calls().len(), 2);
}

#[tokio::test]
async fn test_backfill_failure_is_not_fatal() {
    let h = Harness::new().with_changes(&[1]);
    h.platform.fail_list_check_runs("rate limited");

    let entry = h.queue.enqueue(admit(1)).await.unwrap();
    assert_eq!(entry.status, QueueStatus::RunningCi);
}

// =============================================================================
// Check Ingestion and Advancement Tests
// =============================================================================

#[tokio::test]
async fn test_green_head_is_merged() {
    let h = Harness::new().with_changes(&[1]);
    let entry = h.queue.enqueue(admit(1)).await.unwrap();

    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    let merged = h.queue.get(entry.id).await.unwrap();
    assert_eq!(merged.status, QueueStatus::Merged);
    assert_eq!(merged.merge_sha.as_deref(), Some("merge-1"));
    assert_eq!(merged.position, None);
    assert_eq!(h.workspace.pushes(), vec!["main"]);
    assert!(h.workspace.is_balanced());
    assert!(!h.locks.is_locked(&repo()).await);
}

#[tokio::test]
async fn test_failing_required_check_fails_head() {
    let mut settings = RepositorySettings::new(repo(), "main");
    settings.required_checks = vec!["test".to_string()];
    let h = Harness::with_settings(settings, Duration::from_secs(5)).with_changes(&[125]);
    let entry = h.queue.enqueue(admit(125)).await.unwrap();

    h.queue
        .record_check_run(&cr(125), completed_check(125, "test", CheckConclusion::Failure))
        .await
        .unwrap();

    let status = h.queue.check_status(&cr(125)).await.unwrap();
    assert!(!status.required.passing);
    assert_eq!(status.required.failing, vec!["test"]);
    assert_eq!(status.mergeable, mergeq::types::MergeableState::Blocked);

    let failed = h.queue.get(entry.id).await.unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.ci_status, CiStatus::Failing);
    assert_eq!(
        failed.failure,
        Some(FailureReason::ChecksFailed {
            checks: vec!["test".to_string()]
        })
    );
    assert!(h.workspace.merges().is_empty());
}

#[tokio::test]
async fn test_only_head_advances_past_ready() {
    let h = Harness::new().with_changes(&[1, 2]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();
    let b = h.queue.enqueue(admit(2)).await.unwrap();

    h.queue
        .record_check_run(&cr(2), completed_check(2, "ci", CheckConclusion::Success))
        .await
        .unwrap();
    assert_eq!(h.queue.get(b.id).await.unwrap().status, QueueStatus::Ready);
    assert_eq!(h.queue.get(a.id).await.unwrap().status, QueueStatus::RunningCi);
    assert!(h.workspace.merges().is_empty());

    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();
    let history = h.queue.history(&repo()).await.unwrap();
    let merged: Vec<u64> = history.iter().map(|e| e.change_request).collect();
    assert_eq!(merged, vec![1, 2]);
    assert!(history.iter().all(|e| e.status == QueueStatus::Merged));
    assert_eq!(h.workspace.commits().len(), 2);
}

#[tokio::test]
async fn test_duplicate_check_delivery_is_idempotent() {
    let h = Harness::new().with_changes(&[1, 2]);
    h.queue.enqueue(admit(1)).await.unwrap();
    let b = h.queue.enqueue(admit(2)).await.unwrap();
    let mut events = h.queue.events().register(None);

    let first = h
        .queue
        .record_check_run(&cr(2), completed_check(2, "ci", CheckConclusion::Success))
        .await
        .unwrap();
    let after_first = h.queue.get(b.id).await.unwrap();
    let second = h
        .queue
        .record_check_run(&cr(2), completed_check(2, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.queue.get(b.id).await.unwrap(), after_first);
    assert_eq!(h.queue.check_status(&cr(2)).await.unwrap().runs.len(), 1);

    let mut check_events = 0;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(20), events.recv()).await {
        if event.kind() == "check_run_updated" {
            check_events += 1;
        }
    }
    assert_eq!(check_events, 1);
}

#[tokio::test]
async fn test_new_push_reevaluates_checks() {
    let h = Harness::new().with_changes(&[1]);
    let entry = h.queue.enqueue(admit(1)).await.unwrap();
    h.platform.set_head_sha(&cr(1), "sha-1b");

    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    let waiting = h.queue.get(entry.id).await.unwrap();
    assert_eq!(waiting.status, QueueStatus::RunningCi);
    assert_eq!(waiting.head_sha.as_deref(), Some("sha-1b"));
    assert!(h.workspace.merges().is_empty());
}

#[tokio::test]
async fn test_checks_for_pushed_commit_are_ingested() {
    let h = Harness::new().with_changes(&[1]);
    let entry = h.queue.enqueue(admit(1)).await.unwrap();
    h.queue
        .record_check_run(&cr(1), common::running_check(1, "ci"))
        .await
        .unwrap();

    h.platform.set_head_sha(&cr(1), "sha-1b");
    let mut pushed = completed_check(1, "ci", CheckConclusion::Success);
    pushed.head_sha = "sha-1b".to_string();
    let run = h.queue.record_check_run(&cr(1), pushed).await.unwrap();
    assert_eq!(run.head_sha, "sha-1b");

    let merged = h.queue.get(entry.id).await.unwrap();
    assert_eq!(merged.status, QueueStatus::Merged);
    assert_eq!(merged.head_sha.as_deref(), Some("sha-1b"));

    // A late result for the replaced commit changes nothing
    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Failure))
        .await
        .unwrap();
    let status = h.queue.check_status(&cr(1)).await.unwrap();
    assert_eq!(status.runs.len(), 1);
    assert_eq!(status.runs[0].head_sha, "sha-1b");
    assert!(status.required.passing);
    assert_eq!(h.queue.get(entry.id).await.unwrap(), merged);
}

#[tokio::test]
async fn test_change_closed_before_merge_is_cancelled() {
    let h = Harness::new().with_changes(&[1]);
    let entry = h.queue.enqueue(admit(1)).await.unwrap();
    h.platform.set_state(&cr(1), ChangeRequestState::Closed);

    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();
    assert_eq!(
        h.queue.get(entry.id).await.unwrap().status,
        QueueStatus::Cancelled
    );
}

#[tokio::test]
async fn test_closed_hook_cancels_active_entry() {
    let h = Harness::new().with_changes(&[1]);
    h.queue.enqueue(admit(1)).await.unwrap();

    let outcome = h.queue.handle_change_closed(&cr(1)).await.unwrap();
    assert!(matches!(outcome, Some(CancelOutcome::Cancelled(_))));
    assert!(h.queue.handle_change_closed(&cr(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rule_admits_matching_change() {
    let mut rule = mergeq::rules::AutoMergeRule::new("automerge");
    rule.match_labels.insert("automerge".to_string());
    rule.required_checks = vec!["ci".to_string()];
    rule.merge_method = MergeMethod::Squash;
    let mut settings = RepositorySettings::new(repo(), "main");
    settings.rules = vec![rule];
    let h = Harness::with_settings(settings, Duration::from_secs(5));

    let mut labelled = common::change_request(9);
    labelled.labels.insert("automerge".to_string());
    h.platform.insert(labelled);
    h.platform.insert(common::change_request(10));

    h.queue
        .record_check_run(&cr(9), completed_check(9, "ci", CheckConclusion::Success))
        .await
        .unwrap();
    h.queue
        .record_check_run(&cr(10), completed_check(10, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    let history = h.queue.history(&repo()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change_request, 9);
    assert_eq!(history[0].status, QueueStatus::Merged);
    assert_eq!(history[0].added_by, "rule:automerge");
    assert_eq!(history[0].merge_method, MergeMethod::Squash);
    assert!(h.queue.list(&repo()).await.unwrap().is_empty());
}

// =============================================================================
// Conflict Tests
// =============================================================================

#[tokio::test]
async fn test_conflict_detection_and_resolution() {
    let h = Harness::new().with_changes(&[1, 2]);
    h.workspace
        .set_conflicts("feat-1", &[("src/a.ts", conflicted_content("feat-1").as_str())]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();
    h.queue.enqueue(admit(2)).await.unwrap();
    let mut events = h.queue.events().register(Some(repo()));

    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    let parked = h.queue.get(a.id).await.unwrap();
    assert_eq!(parked.status, QueueStatus::Failed);
    assert!(parked.resolvable);
    assert_eq!(
        parked.failure,
        Some(FailureReason::Conflicts {
            paths: vec!["src/a.ts".to_string()]
        })
    );
    assert_eq!(parked.conflict.as_ref().unwrap().base_sha, "base-0");

    let mut saw_conflicts = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(20), events.recv()).await {
        saw_conflicts |= event.kind() == "conflicts_detected";
    }
    assert!(saw_conflicts);

    let report = h.queue.check_conflicts(a.id).await.unwrap();
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].path, "src/a.ts");
    assert!(report.files[0].content.contains("<<<<<<<"));

    let merged = h
        .queue
        .resolve_conflicts(a.id, &[resolution("src/a.ts", "const a = 3;\n")])
        .await
        .unwrap();
    assert_eq!(merged.status, QueueStatus::Merged);
    assert!(!merged.resolvable);
    assert!(merged.failure.is_none());
    assert_eq!(merged.merge_sha.as_deref(), Some("merge-1"));

    let queue = h.queue.list(&repo()).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].change_request, 2);
    assert_eq!(queue[0].position, Some(0));

    assert!(h.workspace.is_balanced());
    assert!(!h.locks.is_locked(&repo()).await);
}

#[tokio::test]
async fn test_incomplete_resolution_keeps_entry_parked() {
    let h = Harness::new().with_changes(&[1]);
    let conflicted = conflicted_content("feat-1");
    h.workspace.set_conflicts("feat-1", &[("src/a.ts", conflicted.as_str())]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();
    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    let err = h
        .queue
        .resolve_conflicts(a.id, &[resolution("src/a.ts", &conflicted)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncompleteResolution(_)));

    let entry = h.queue.get(a.id).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert!(entry.resolvable);
    assert!(h.workspace.commits().is_empty());
    assert!(h.workspace.is_balanced());
}

#[tokio::test]
async fn test_resolution_requires_parked_entry() {
    let h = Harness::new().with_changes(&[1]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();

    let err = h
        .queue
        .resolve_conflicts(a.id, &[resolution("src/a.ts", "x")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotResolvable(id) if id == a.id));
}

#[tokio::test]
async fn test_base_moved_during_resolution_requeues() {
    let h = Harness::new().with_changes(&[1]);
    h.workspace
        .set_conflicts("feat-1", &[("src/a.ts", conflicted_content("feat-1").as_str())]);
    let a = h.queue.enqueue(admit(1)).await.unwrap();
    h.queue
        .record_check_run(&cr(1), completed_check(1, "ci", CheckConclusion::Success))
        .await
        .unwrap();

    h.workspace.set_base_sha("base-1");
    let err = h
        .queue
        .resolve_conflicts(a.id, &[resolution("src/a.ts", "const a = 3;\n")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentBaseUpdate(_)));

    let stale = h.queue.get(a.id).await.unwrap();
    assert_eq!(stale.failure, Some(FailureReason::ConcurrentBaseUpdate));
    assert!(!stale.resolvable);

    // The re-queued entry ran detection again against the new base
    let history = h.queue.history(&repo()).await.unwrap();
    assert_eq!(history.len(), 2);
    let requeued = history.iter().find(|e| e.id != a.id).unwrap();
    assert_eq!(requeued.change_request, 1);
    assert!(requeued.resolvable);
    assert_eq!(requeued.conflict.as_ref().unwrap().base_sha, "base-1");
    assert!(h.workspace.commits().is_empty());
}

#[tokio::test]
async fn test_conflict_at_merge_time_is_recorded() {
    let h = unguarded(Duration::from_secs(5)).with_changes(&[1]);
    h.workspace
        .set_conflicts("feat-1", &[("src/a.ts", conflicted_content("feat-1").as_str())]);
    h.workspace.conflict_only_in(mergeq::workspace::MergeMode::Squash);
    let mut request = admit(1);
    request.merge_method = MergeMethod::Squash;

    // Detection merges cleanly, the squash itself conflicts
    let entry = h.queue.enqueue(request).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert!(entry.resolvable);
    let record = entry.conflict.clone().unwrap();
    assert_eq!(record.base_sha, "base-0");
    assert_eq!(record.paths, vec!["src/a.ts"]);

    h.workspace.set_base_sha("base-1");
    let err = h
        .queue
        .resolve_conflicts(entry.id, &[resolution("src/a.ts", "const a = 3;\n")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentBaseUpdate(_)));
    assert!(h.workspace.commits().is_empty());
    assert!(!h.queue.get(entry.id).await.unwrap().resolvable);
}

#[tokio::test]
async fn test_conflict_at_merge_time_can_be_resolved() {
    let h = unguarded(Duration::from_secs(5)).with_changes(&[1]);
    h.workspace
        .set_conflicts("feat-1", &[("src/a.ts", conflicted_content("feat-1").as_str())]);
    h.workspace.conflict_only_in(mergeq::workspace::MergeMode::Squash);
    let mut request = admit(1);
    request.merge_method = MergeMethod::Squash;
    let entry = h.queue.enqueue(request).await.unwrap();

    let merged = h
        .queue
        .resolve_conflicts(entry.id, &[resolution("src/a.ts", "const a = 3;\n")])
        .await
        .unwrap();
    assert_eq!(merged.status, QueueStatus::Merged);
    assert!(merged.conflict.is_none());
    assert_eq!(h.workspace.pushes(), vec!["main"]);
}

// =============================================================================
// Merge Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_push_rejection_fails_entry() {
    let h = unguarded(Duration::from_secs(5)).with_changes(&[1]);
    h.workspace.reject_push("protected branch hook declined");

    let entry = h.queue.enqueue(admit(1)).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert!(matches!(entry.failure, Some(FailureReason::PushRejected { .. })));
    assert!(!entry.resolvable);
    assert!(h.workspace.is_balanced());
}

#[tokio::test]
async fn test_merge_timeout_fails_entry() {
    let h = unguarded(Duration::from_millis(50)).with_changes(&[1]);
    h.workspace
        .delay_merge(mergeq::workspace::MergeMode::Squash, Duration::from_secs(2));

    let mut request = admit(1);
    request.merge_method = MergeMethod::Squash;
    let entry = h.queue.enqueue(request).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.failure, Some(FailureReason::Timeout));

    // The abandoned lease is released in the background
    for _ in 0..200 {
        if !h.locks.is_locked(&repo()).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.locks.is_locked(&repo()).await);
}

#[tokio::test]
async fn test_cancel_while_merging_is_deferred() {
    let h = unguarded(Duration::from_secs(5)).with_changes(&[1]);
    h.workspace
        .delay_merge(mergeq::workspace::MergeMode::Squash, Duration::from_millis(200));
    h.workspace.reject_push("stale info");

    let queue = h.queue.clone();
    let mut request = admit(1);
    request.merge_method = MergeMethod::Squash;
    let task = tokio::spawn(async move { queue.enqueue(request).await });

    let merging = h.wait_for_status(1, QueueStatus::Merging).await;
    let outcome = h.queue.cancel(merging.id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Deferred(_)));
    assert!(outcome.entry().cancel_requested);
    assert_eq!(outcome.entry().status, QueueStatus::Merging);

    let finished = task.await.unwrap().unwrap();
    assert_eq!(finished.status, QueueStatus::Cancelled);
}

#[tokio::test]
async fn test_completed_merge_wins_over_deferred_cancel() {
    let h = unguarded(Duration::from_secs(5)).with_changes(&[1]);
    h.workspace
        .delay_merge(mergeq::workspace::MergeMode::Squash, Duration::from_millis(200));

    let queue = h.queue.clone();
    let mut request = admit(1);
    request.merge_method = MergeMethod::Squash;
    let task = tokio::spawn(async move { queue.enqueue(request).await });

    let merging = h.wait_for_status(1, QueueStatus::Merging).await;
    h.queue.cancel(merging.id).await.unwrap();

    let finished = task.await.unwrap().unwrap();
    assert_eq!(finished.status, QueueStatus::Merged);
    assert!(finished.merge_sha.is_some());
}

type EnqueueTask = tokio::task::JoinHandle<Result<mergeq::types::QueueEntry, Error>>;

/// Persistent queue whose #1 is stalled mid-squash
async fn merging_with_state_dir(state: &tempfile::TempDir) -> (Harness, EnqueueTask) {
    let h = Harness::with_store(
        RepositorySettings::new(repo(), "main"),
        Duration::from_secs(5),
        QueueStore::persistent(state.path()),
    )
    .with_changes(&[1]);
    h.workspace
        .delay_merge(mergeq::workspace::MergeMode::Squash, Duration::from_millis(200));

    let queue = h.queue.clone();
    let mut request = admit(1);
    request.merge_method = MergeMethod::Squash;
    let task = tokio::spawn(async move { queue.enqueue(request).await });
    h.wait_for_status(1, QueueStatus::Merging).await;
    (h, task)
}

/// Make the next queue snapshot write fail
fn block_queue_file(state: &tempfile::TempDir) {
    let path = storage::queue_path(state.path(), &repo());
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir_all(path.join("blocked")).unwrap();
}

#[tokio::test]
async fn test_advance_error_is_returned() {
    let state = tempfile::TempDir::new().unwrap();
    let (h, task) = merging_with_state_dir(&state).await;

    block_queue_file(&state);
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(h.workspace.pushes(), vec!["main"]);
}

#[tokio::test]
async fn test_advance_error_does_not_drop_pending_trigger() {
    let state = tempfile::TempDir::new().unwrap();
    let (h, task) = merging_with_state_dir(&state).await;

    // Arrives while the merge is in flight, so the running pass owns it
    h.queue.advance(&repo()).await.unwrap();
    block_queue_file(&state);

    // The failed pass is followed by one more evaluation, which finds the
    // head still merging and stops cleanly
    let entry = task.await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Merging);
    assert_eq!(h.workspace.pushes(), vec!["main"]);
}

#[tokio::test]
async fn test_sweep_with_nothing_stuck() {
    let h = Harness::new().with_changes(&[1]);
    h.queue.enqueue(admit(1)).await.unwrap();

    let report = h.queue.sweep().await.unwrap();
    assert!(report.timed_out.is_empty());
}

// =============================================================================
// HTTP API Tests
// =============================================================================

mod api_test {
    use crate::common::{Harness, repo};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use mergeq::api::{AppState, router};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app(h: &Harness) -> Router {
        router(AppState::new(h.queue.clone()))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let (status, body) = send(&app(&h), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_queue_lifecycle_over_http() {
        let h = Harness::new().with_changes(&[1]);
        let app = app(&h);

        let (status, entry) = send(&app, "POST", "/repos/acme/widgets/queue", Some(json!({"number": 1}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["status"], "running_ci");
        assert_eq!(entry["added_by"], "api");

        let (status, err) = send(&app, "POST", "/repos/acme/widgets/queue", Some(json!({"number": 1}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "already_queued");

        let (status, items) = send(&app, "GET", "/repos/acme/widgets/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(items[0]["title"], "Change 1");
        assert_eq!(items[0]["position"], 0);

        let (status, run) = send(
            &app,
            "POST",
            "/repos/acme/widgets/pulls/1/check-runs",
            Some(json!({"name": "ci", "head_sha": "sha-1", "status": "completed", "conclusion": "success"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["conclusion"], "success");

        let (_, history) = send(&app, "GET", "/repos/acme/widgets/queue/history", None).await;
        assert_eq!(history[0]["status"], "merged");

        let (status, checks) = send(&app, "GET", "/repos/acme/widgets/pulls/1/checks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(checks["mergeable"], "clean");
        assert_eq!(checks["summary"]["passed"], 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let h = Harness::new().with_changes(&[1]);
        let app = app(&h);

        let (status, err) = send(&app, "GET", "/repos/acme/other/queue", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "unknown_repository");

        let missing = mergeq::types::EntryId::generate();
        let (status, err) = send(&app, "DELETE", &format!("/repos/acme/widgets/queue/{missing}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "entry_not_found");

        let (status, err) = send(
            &app,
            "PUT",
            "/repos/acme/widgets/queue/order",
            Some(json!({"entries": [missing]})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "invalid_reorder");
    }

    #[tokio::test]
    async fn test_entry_of_other_repository_is_not_found() {
        let h = Harness::new().with_changes(&[1]);
        let entry = h
            .queue
            .enqueue(mergeq::driver::AdmitRequest::new(crate::common::cr(1), "dev"))
            .await
            .unwrap();
        let app = app(&h);

        let (status, body) = send(&app, "GET", &format!("/repos/acme/widgets/queue/{}", entry.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repository"], repo().to_string());

        let (status, _) = send(&app, "GET", &format!("/repos/acme/gadgets/queue/{}", entry.id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_over_http() {
        let h = Harness::new().with_changes(&[1]);
        let entry = h
            .queue
            .enqueue(mergeq::driver::AdmitRequest::new(crate::common::cr(1), "dev"))
            .await
            .unwrap();

        let (status, body) = send(&app(&h), "DELETE", &format!("/repos/acme/widgets/queue/{}", entry.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deferred"], false);
        assert_eq!(body["entry"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_event_stream_content_type() {
        let h = Harness::new();
        let request = Request::builder()
            .uri("/events?repository=acme/widgets")
            .body(Body::empty())
            .unwrap();
        let response = app(&h).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }
}

// =============================================================================
// GitHub Service Tests
// =============================================================================

mod github_test {
    use crate::common::{cr, repo};
    use mergeq::checks::{CheckConclusion, CheckStatus};
    use mergeq::error::Error;
    use mergeq::platform::{ChangeRequestService, GitHubService};
    use mockito::Matcher;

    #[tokio::test]
    async fn test_latest_review_per_reviewer_counts() {
        let mut server = mockito::Server::new_async().await;
        let reviews = server
            .mock("GET", "/repos/acme/widgets/pulls/7/reviews")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"user": {"login": "bob"}, "state": "APPROVED"},
                    {"user": {"login": "carol"}, "state": "APPROVED"},
                    {"user": {"login": "carol"}, "state": "CHANGES_REQUESTED"},
                    {"user": {"login": "dave"}, "state": "COMMENTED"}
                ]"#,
            )
            .create_async()
            .await;

        let service = GitHubService::with_api_base("test-token", &server.url())
            .unwrap()
            .with_code_owners(repo(), ["bob".to_string()]);
        let approvals = service.list_approvals(&cr(7)).await.unwrap();

        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].reviewer, "bob");
        assert!(approvals[0].is_code_owner);
        reviews.assert_async().await;
    }

    #[tokio::test]
    async fn test_check_runs_are_mapped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widgets/commits/abc123/check-runs")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "total_count": 2,
                    "check_runs": [
                        {"name": "build", "head_sha": "abc123", "status": "completed", "conclusion": "success"},
                        {"name": "e2e", "head_sha": "abc123", "status": "in_progress", "conclusion": null,
                         "output": {"title": "Running", "summary": null}}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let service = GitHubService::with_api_base("test-token", &server.url()).unwrap();
        let runs = service.list_check_runs(&cr(7), "abc123").await.unwrap();

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, CheckStatus::Completed);
        assert_eq!(runs[0].conclusion, Some(CheckConclusion::Success));
        assert_eq!(runs[1].status, CheckStatus::InProgress);
        assert_eq!(runs[1].conclusion, None);
        assert_eq!(runs[1].output.as_ref().unwrap().title.as_deref(), Some("Running"));
    }

    #[tokio::test]
    async fn test_unknown_commit_has_no_check_runs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widgets/commits/missing/check-runs")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let service = GitHubService::with_api_base("test-token", &server.url()).unwrap();
        assert!(service.list_check_runs(&cr(7), "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widgets/pulls/7/reviews")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let service = GitHubService::with_api_base("test-token", &server.url()).unwrap();
        let err = service.list_approvals(&cr(7)).await.unwrap_err();
        assert!(matches!(err, Error::GitHubApi(_)));
    }
}

// =============================================================================
// Git Workspace Tests
// =============================================================================

mod git_workspace_test {
    use crate::common::{TempGitRemote, repo};
    use mergeq::conflicts::{ConflictResolver, MergeTarget, Resolution};
    use mergeq::types::MergeMethod;
    use mergeq::workspace::{GitCli, RepoLocks};
    use std::sync::Arc;
    use std::time::Duration;

    fn target(head_ref: &str, method: MergeMethod) -> MergeTarget {
        MergeTarget {
            repository: repo(),
            number: 1,
            title: format!("Merge {head_ref}"),
            head_ref: head_ref.to_string(),
            base_branch: "main".to_string(),
            method,
        }
    }

    #[tokio::test]
    async fn test_detect_resolve_and_merge_against_real_remote() {
        if !TempGitRemote::available() {
            return;
        }
        let remote = TempGitRemote::new();
        remote.branch("feature", "main");
        remote.commit("src/a.ts", "const a = 2;\n", "feature change");
        remote.push("feature");
        remote.switch("main");
        remote.commit("src/a.ts", "const a = 1;\n", "main change");
        remote.push("main");
        remote.branch("clean", "main");
        remote.commit("src/b.ts", "export const b = 1;\n", "add b");
        remote.push("clean");

        let git = GitCli::new(
            remote.workspaces(),
            remote.origin().to_string_lossy(),
            "mergeq",
            "mergeq@example.com",
        );
        let locks = Arc::new(RepoLocks::new(Duration::from_secs(5)));
        let resolver = ConflictResolver::new(Arc::new(git), locks, "origin");

        let report = resolver
            .check_conflicts(&target("feature", MergeMethod::Merge))
            .await
            .unwrap();
        assert_eq!(report.base_sha, remote.rev("main"));
        assert_eq!(report.paths(), vec!["src/a.ts"]);
        assert!(report.files[0].content.contains("<<<<<<<"));

        let record = report.record();
        let sha = resolver
            .resolve_conflicts(
                &target("feature", MergeMethod::Merge),
                &[Resolution {
                    path: "src/a.ts".to_string(),
                    content: "const a = 3;\n".to_string(),
                }],
                Some(&record),
            )
            .await
            .unwrap();
        assert_eq!(remote.rev("main"), sha);
        assert_eq!(remote.show("main", "src/a.ts"), "const a = 3;");

        let squashed = resolver
            .merge_clean(&target("clean", MergeMethod::Squash))
            .await
            .unwrap();
        assert_eq!(remote.rev("main"), squashed);
        assert_eq!(remote.show("main", "src/b.ts"), "export const b = 1;");
    }
}
