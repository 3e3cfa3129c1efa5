//! Queue store
//!
//! - `order` - pure ordering and stack validation
//! - `store` - per-repository serialized mutations
//! - `storage` - durable TOML snapshots

pub mod order;
pub mod storage;
mod store;

pub use order::{canonical_order, insertion_index, renumber, validate_stack_order};
pub use store::{EnqueueRequest, QueueStore};
