//! Batch Execution
//!
//! The batch orchestrator and its merge stage.

mod merge;
mod orchestrator;

pub use merge::{MERGE_CONFLICT, MERGE_CONFLICT_SKIPPED};
pub use orchestrator::BatchOrchestrator;
