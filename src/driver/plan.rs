//! Head-of-queue planning - pure functions
//!
//! Decides what the driver should do next with an entry given its check
//! state. No I/O happens here; the driver gathers the inputs and executes
//! the returned step.

use crate::checks::{CheckSummary, RequiredChecks};
use crate::types::{ChangeRequest, CiStatus, FailureReason, QueueEntry, QueueStatus};

/// Next step for the entry at the head of a repository's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadStep {
    /// A merge is in flight; nothing to do until it finishes
    Idle,
    /// Checks outstanding; park in `running_ci`
    Wait {
        /// What is still outstanding
        reasons: Vec<String>,
    },
    /// Checks passed; move to `ready`
    MarkReady,
    /// Detect conflicts and integrate
    Merge,
    /// Give up on the entry
    Fail {
        /// Recorded failure
        reason: FailureReason,
    },
    /// A deferred cancellation is due
    Cancel,
}

impl std::fmt::Display for HeadStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle (merge in flight)"),
            Self::Wait { reasons } => write!(f, "wait: {}", reasons.join(", ")),
            Self::MarkReady => write!(f, "mark ready"),
            Self::Merge => write!(f, "merge"),
            Self::Fail { reason } => write!(f, "fail: {reason}"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Whether every check and every required check passed
pub fn checks_green(summary: &CheckSummary, required: &RequiredChecks) -> bool {
    summary.all_passing && required.passing
}

/// Mirror of the aggregated check state for a queue entry
pub fn ci_status(summary: &CheckSummary, required: &RequiredChecks) -> CiStatus {
    if checks_green(summary, required) {
        CiStatus::Passing
    } else if summary.failed > 0 || !required.failing.is_empty() {
        CiStatus::Failing
    } else {
        CiStatus::Pending
    }
}

/// Status a non-head entry should hold: never past `ready`
pub fn capped_status(summary: &CheckSummary, required: &RequiredChecks) -> QueueStatus {
    if checks_green(summary, required) {
        QueueStatus::Ready
    } else {
        QueueStatus::RunningCi
    }
}

/// Plan the next step for the head entry (PURE)
pub fn plan_head(entry: &QueueEntry, summary: &CheckSummary, required: &RequiredChecks) -> HeadStep {
    if entry.status == QueueStatus::Merging {
        return HeadStep::Idle;
    }
    if entry.cancel_requested {
        return HeadStep::Cancel;
    }

    // A failure with nothing pending can never turn green on its own
    let pending = summary.pending > 0;
    if !pending && (summary.failed > 0 || !required.failing.is_empty()) {
        let mut checks = required.failing.clone();
        if checks.is_empty() {
            checks.push(format!("{} failing check(s)", summary.failed));
        }
        return HeadStep::Fail {
            reason: FailureReason::ChecksFailed { checks },
        };
    }

    if checks_green(summary, required) {
        return if entry.status == QueueStatus::Ready {
            HeadStep::Merge
        } else {
            HeadStep::MarkReady
        };
    }

    let mut reasons = Vec::new();
    if pending {
        reasons.push(format!("{} check(s) pending", summary.pending));
    }
    if !required.missing.is_empty() {
        reasons.push(format!("waiting for {}", required.missing.join(", ")));
    }
    if !required.failing.is_empty() {
        reasons.push(format!("re-running {}", required.failing.join(", ")));
    }
    HeadStep::Wait { reasons }
}

/// Whether an auto-merge rule may admit `change` again (PURE)
///
/// A change whose last entry failed or was cancelled needs a new head
/// commit or a different approval count before it is re-admitted.
pub fn readmission_allowed(previous: Option<&QueueEntry>, change: &ChangeRequest) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    match previous.status {
        QueueStatus::Failed | QueueStatus::Cancelled | QueueStatus::Merged => {
            previous.head_sha.as_deref() != Some(change.head_sha.as_str())
                || previous.approvals_at_admission != change.approval_count()
        }
        _ => true,
    }
}
