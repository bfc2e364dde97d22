//! Batch Models
//!
//! In-memory batch state owned by the orchestrator, and the read-only views
//! handed out to callers.

use std::path::PathBuf;

use board_runner_core::{
    BatchMode, BatchStatus, BatchTaskBrief, BatchTaskStatus, ConflictPolicy,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::credential::Credential;
use crate::models::settings::ExecutionSettings;
use crate::models::task::Repository;

// ============================================================================
// Types
// ============================================================================

/// Concurrency settings captured when the batch is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettings {
    pub max_concurrent: usize,
    pub auto_approve: bool,
    pub stop_on_failure: bool,
    pub conflict_behavior: ConflictPolicy,
}

impl From<&ExecutionSettings> for BatchSettings {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            max_concurrent: settings.max_batch_size.max(1),
            auto_approve: settings.queue_auto_approve,
            stop_on_failure: settings.stop_on_failure,
            conflict_behavior: settings.conflict_behavior,
        }
    }
}

/// One task inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTask {
    pub task_id: String,
    pub title: String,
    pub status: BatchTaskStatus,
    pub worktree_path: Option<PathBuf>,
    /// `<namespace>/<taskId>`
    pub branch: String,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set while the completion handler commits the worktree
    #[serde(skip)]
    pub settling: bool,
}

impl BatchTask {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>, branch: String) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            status: BatchTaskStatus::Queued,
            worktree_path: None,
            branch,
            session_id: None,
            error: None,
            started_at: None,
            completed_at: None,
            settling: false,
        }
    }

    pub fn brief(&self) -> BatchTaskBrief {
        BatchTaskBrief {
            task_id: self.task_id.clone(),
            title: self.title.clone(),
            status: self.status,
        }
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// A set of tasks executed together and delivered as one pull request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub repository: Repository,
    pub mode: BatchMode,
    pub status: BatchStatus,
    pub tasks: Vec<BatchTask>,
    pub settings: BatchSettings,
    pub main_repo_path: PathBuf,
    pub batch_branch: String,
    pub pr_url: Option<String>,
    pub user_id: Option<String>,
    #[serde(skip)]
    pub credential: Option<Credential>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn task(&self, task_id: &str) -> Option<&BatchTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut BatchTask> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn count(&self, status: BatchTaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Whether any task is still queued or running.
    pub fn has_pending_work(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, BatchTaskStatus::Queued | BatchTaskStatus::Running))
    }

    /// Index of the first queued task in submission order.
    pub fn next_queued(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.status == BatchTaskStatus::Queued)
    }

    pub fn briefs(&self) -> Vec<BatchTaskBrief> {
        self.tasks.iter().map(BatchTask::brief).collect()
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress::from_tasks(&self.tasks)
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            id: self.id.clone(),
            status: self.status,
            mode: self.mode,
            task_count: self.tasks.len(),
            created_at: self.created_at,
        }
    }

    pub fn status_view(&self) -> BatchStatusView {
        BatchStatusView {
            id: self.id.clone(),
            status: self.status,
            mode: self.mode,
            batch_branch: self.batch_branch.clone(),
            tasks: self.tasks.clone(),
            pr_url: self.pr_url.clone(),
            progress: self.progress(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Per-status task counts and overall completion percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub queued: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Share of tasks in a terminal state, rounded to a whole percent
    pub percentage: u8,
}

impl BatchProgress {
    pub fn from_tasks(tasks: &[BatchTask]) -> Self {
        let mut progress = BatchProgress {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            match task.status {
                BatchTaskStatus::Queued => progress.queued += 1,
                BatchTaskStatus::Running => progress.running += 1,
                BatchTaskStatus::Completed => progress.completed += 1,
                BatchTaskStatus::Failed => progress.failed += 1,
                BatchTaskStatus::Skipped => progress.skipped += 1,
                BatchTaskStatus::Cancelled => progress.cancelled += 1,
            }
        }
        if progress.total > 0 {
            let done = progress.completed + progress.failed + progress.skipped + progress.cancelled;
            progress.percentage = ((done as f64 / progress.total as f64) * 100.0).round() as u8;
        }
        progress
    }

    /// Sum of all buckets; always equal to `total`.
    pub fn bucket_sum(&self) -> usize {
        self.completed + self.failed + self.running + self.queued + self.skipped + self.cancelled
    }
}

/// Full snapshot returned by `get_batch`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusView {
    pub id: String,
    pub status: BatchStatus,
    pub mode: BatchMode,
    pub batch_branch: String,
    pub tasks: Vec<BatchTask>,
    pub pr_url: Option<String>,
    pub progress: BatchProgress,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchStatusView {
    pub fn task(&self, task_id: &str) -> Option<&BatchTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// List entry returned by `get_active_batches`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub id: String,
    pub status: BatchStatus,
    pub mode: BatchMode,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
}
