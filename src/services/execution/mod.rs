//! Agent Execution
//!
//! Event routing, delta buffering and the single-task execution path.

mod controller;
mod delta_buffer;
mod router;

pub use controller::*;
pub use delta_buffer::*;
pub use router::*;
