//! Execution Models
//!
//! Read-only view of a single-task execution.

use std::path::PathBuf;

use board_runner_core::ExecutionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of a live single-task execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub task_id: String,
    pub repository_id: Option<String>,
    pub session_id: Option<String>,
    pub repo_path: Option<PathBuf>,
    pub branch: String,
    pub status: ExecutionStatus,
    pub cancelled: bool,
    pub files_changed: u32,
    pub tools_executed: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub estimated_progress: u8,
    pub log_count: usize,
}
