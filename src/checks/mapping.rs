//! Mapping of external CI status/conclusion strings into the check model
//!
//! External providers report free-form strings. Everything is mapped into
//! closed enums; conclusions with no mapping become `None` (pending) so an
//! unrecognized value can never count as a pass.

use super::{CheckConclusion, CheckStatus};
use crate::error::Error;
use std::str::FromStr;
use tracing::warn;

/// Map an external status string.
///
/// `queued`/`waiting` map to `Queued`, `in_progress` to `InProgress`, and
/// everything else (including `completed`, `success`, `failure`) to
/// `Completed`.
pub fn map_status(raw: &str) -> CheckStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "queued" | "waiting" => CheckStatus::Queued,
        "in_progress" => CheckStatus::InProgress,
        _ => CheckStatus::Completed,
    }
}

/// Map an external conclusion string.
///
/// Returns `None` for values with no mapping, logging the fallback.
pub fn map_conclusion(raw: &str) -> Option<CheckConclusion> {
    match raw.parse::<CheckConclusion>() {
        Ok(conclusion) => Some(conclusion),
        Err(err) => {
            warn!(error = %err, "unmapped check conclusion, treating as pending");
            None
        }
    }
}

impl FromStr for CheckStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(Error::CheckMappingUnknown {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for CheckConclusion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "failure" | "error" => Ok(Self::Failure),
            "neutral" | "skipped" => Ok(Self::Neutral),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            "action_required" => Ok(Self::ActionRequired),
            _ => Err(Error::CheckMappingUnknown {
                field: "conclusion",
                value: s.to_string(),
            }),
        }
    }
}
