//! mergeq - merge queue orchestration for change requests
//!
//! Serializes the integration of pull requests into a repository's base
//! branch. Admitted change requests wait in a per-repository queue while
//! their CI checks run; the entry at the head of the queue is checked for
//! conflicts against a fresh base and merged, one at a time, through a
//! locked git workspace.
//!
//! # Components
//!
//! - [`queue`] - ordered entries per repository with stack ordering
//! - [`checks`] - check-run ingestion and mergeable state
//! - [`rules`] - auto-merge admission rules
//! - [`conflicts`] - conflict detection and human resolution
//! - [`driver`] - the state machine tying it together
//! - [`api`] - HTTP surface

pub mod api;
pub mod auth;
pub mod checks;
pub mod config;
pub mod conflicts;
pub mod driver;
pub mod error;
pub mod events;
pub mod platform;
pub mod queue;
pub mod rules;
pub mod telemetry;
pub mod types;
pub mod workspace;

pub use error::{Error, Result};
