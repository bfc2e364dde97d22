//! Board Runner
//!
//! Executes coding-agent tasks from a task board against git repositories.
//! It includes:
//! - Batch orchestration over isolated worktrees of a shared mirror
//! - The single-task execution path
//! - Agent event routing and streamed output reassembly
//! - Storage layer (SQLite board store, JSON config)

pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod utils;

pub use state::RunnerState;
pub use utils::error::{AppError, AppResult};
