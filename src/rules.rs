//! Auto-merge rule evaluation
//!
//! Pure functions deciding whether a change request is eligible for automatic
//! queue admission. Admission itself is performed by the queue driver.

use crate::checks::CheckRun;
use crate::types::{ChangeRequest, MergeMethod};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A declarative policy that admits matching change requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct AutoMergeRule {
    /// Rule name (for logs and the admitting actor)
    pub name: String,
    /// Labels a change must carry to be considered (ignored when empty)
    #[serde(default)]
    pub match_labels: BTreeSet<String>,
    /// Labels a change must carry to match
    #[serde(default)]
    pub required_labels: BTreeSet<String>,
    /// Checks that must be completed with success
    #[serde(default)]
    pub required_checks: Vec<String>,
    /// Minimum number of approving reviews
    #[serde(default)]
    pub min_approvals: u32,
    /// Require at least one approval from a code owner
    #[serde(default)]
    pub require_code_owner_approval: bool,
    /// Allow draft change requests
    #[serde(default)]
    pub allow_draft: bool,
    /// Minimum minutes since the change's last update
    #[serde(default)]
    pub min_time_in_queue_minutes: u32,
    /// Merge method for auto-admitted entries
    #[serde(default)]
    pub merge_method: MergeMethod,
    /// Disabled rules are never evaluated
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl AutoMergeRule {
    /// Create an enabled rule with no conditions
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            match_labels: BTreeSet::new(),
            required_labels: BTreeSet::new(),
            required_checks: Vec::new(),
            min_approvals: 0,
            require_code_owner_approval: false,
            allow_draft: false,
            min_time_in_queue_minutes: 0,
            merge_method: MergeMethod::default(),
            is_enabled: true,
        }
    }

    /// Reasons this rule does not match; empty when it matches
    pub fn mismatch_reasons(
        &self,
        change: &ChangeRequest,
        checks: &[CheckRun],
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut reasons = Vec::new();

        if !self.match_labels.is_subset(&change.labels) {
            reasons.push(format!(
                "missing match labels: {}",
                join(self.match_labels.difference(&change.labels))
            ));
        }
        if !self.required_labels.is_subset(&change.labels) {
            reasons.push(format!(
                "missing required labels: {}",
                join(self.required_labels.difference(&change.labels))
            ));
        }

        let not_passing: Vec<&str> = self
            .required_checks
            .iter()
            .filter(|name| {
                !checks
                    .iter()
                    .any(|run| &run.name == *name && run.head_sha == change.head_sha && run.is_success())
            })
            .map(String::as_str)
            .collect();
        if !not_passing.is_empty() {
            reasons.push(format!("required checks not passing: {}", not_passing.join(", ")));
        }

        let approvals = change.approval_count();
        if approvals < self.min_approvals {
            reasons.push(format!(
                "{approvals} of {} required approvals",
                self.min_approvals
            ));
        }
        if self.require_code_owner_approval && !change.has_code_owner_approval() {
            reasons.push("no code owner approval".to_string());
        }
        if change.is_draft && !self.allow_draft {
            reasons.push("change request is a draft".to_string());
        }

        let settle = Duration::minutes(i64::from(self.min_time_in_queue_minutes));
        if now - change.updated_at < settle {
            reasons.push(format!(
                "updated less than {} minute(s) ago",
                self.min_time_in_queue_minutes
            ));
        }

        reasons
    }
}

fn join<'a>(labels: impl Iterator<Item = &'a String>) -> String {
    labels.map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Result of evaluating a rule set
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluation {
    /// Whether any rule matched
    pub matched: bool,
    /// The first matching rule
    pub rule: Option<AutoMergeRule>,
    /// Rejection reasons per evaluated rule name (in evaluation order)
    pub rejections: Vec<(String, Vec<String>)>,
}

/// Evaluate rules in definition order (PURE)
///
/// Disabled rules are skipped. The first matching rule wins and supplies the
/// merge method for auto-admission.
pub fn evaluate(
    change: &ChangeRequest,
    rules: &[AutoMergeRule],
    checks: &[CheckRun],
    now: DateTime<Utc>,
) -> RuleEvaluation {
    let mut evaluation = RuleEvaluation::default();

    for rule in rules.iter().filter(|r| r.is_enabled) {
        let reasons = rule.mismatch_reasons(change, checks, now);
        if reasons.is_empty() {
            evaluation.matched = true;
            evaluation.rule = Some(rule.clone());
            break;
        }
        evaluation.rejections.push((rule.name.clone(), reasons));
    }

    evaluation
}
