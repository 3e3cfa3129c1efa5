//! Queue driver
//!
//! Two layers, like the rest of the engine:
//! 1. Plan - decide the head entry's next step from its check state (pure)
//! 2. Execute - apply the step against the store, aggregator and workspace
//!
//! The driver never waits on its own: every transition is triggered by an
//! admission, a check completion, a resolution or a removal, and the driver
//! re-evaluates the affected repository in response.

mod execute;
pub mod plan;

pub use execute::{
    AdmitRequest, CancelOutcome, CheckStatusReport, DriverSettings, MergeQueue, QueueItem,
    RepositorySettings, SweepReport,
};
pub use plan::{HeadStep, capped_status, checks_green, ci_status, plan_head, readmission_allowed};
