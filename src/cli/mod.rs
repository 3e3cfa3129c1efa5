//! Command implementations for the `mergeq` binary

pub mod auth;
pub mod client;
pub mod conflicts;
pub mod context;
pub mod queue;
pub mod serve;
pub mod style;
