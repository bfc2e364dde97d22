//! Data Models
//!
//! Contains the data structures shared by the orchestrator services.

pub mod batch;
pub mod credential;
pub mod execution;
pub mod settings;
pub mod task;

pub use batch::*;
pub use credential::*;
pub use execution::*;
pub use settings::*;
pub use task::*;
