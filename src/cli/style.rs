//! Terminal styling helpers
//!
//! Output goes through `anstream`, which strips the colors again when stdout
//! is not a terminal.

use mergeq::types::QueueStatus;
use owo_colors::OwoColorize;
use std::fmt::Display;

/// Semantic colors for CLI output
pub trait Stylize {
    /// De-emphasized text
    fn muted(&self) -> String;
    /// Names and identifiers
    fn accent(&self) -> String;
    /// Headings
    fn emphasis(&self) -> String;
    /// Positive outcomes
    fn success(&self) -> String;
    /// Problems
    fn warn(&self) -> String;
}

impl<T: Display> Stylize for T {
    fn muted(&self) -> String {
        self.dimmed().to_string()
    }

    fn accent(&self) -> String {
        self.cyan().to_string()
    }

    fn emphasis(&self) -> String {
        self.bold().to_string()
    }

    fn success(&self) -> String {
        self.green().to_string()
    }

    fn warn(&self) -> String {
        self.yellow().to_string()
    }
}

/// Check mark
pub const fn check() -> &'static str {
    "✓"
}

/// Status label colored by outcome
pub fn status_label(status: QueueStatus) -> String {
    match status {
        QueueStatus::Merged | QueueStatus::Ready => status.success(),
        QueueStatus::Failed => status.red().to_string(),
        QueueStatus::Merging => status.accent(),
        QueueStatus::Cancelled => status.muted(),
        QueueStatus::Pending | QueueStatus::RunningCi => status.warn(),
    }
}
