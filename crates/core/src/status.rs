//! Status Vocabulary
//!
//! Lifecycle states for batches, batch tasks, single-task executions and the
//! board's own task records. All enums serialize as the lowercase strings the
//! board clients expect.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a batch schedules its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// Up to `max_concurrent` tasks run at the same time
    Parallel,
    /// One task at a time, optionally gated on explicit approval
    Queue,
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchMode::Parallel => write!(f, "parallel"),
            BatchMode::Queue => write!(f, "queue"),
        }
    }
}

/// Aggregate batch state.
///
/// `pending -> running -> merging -> {completed | failed}`, with
/// `running -> cancelled` reachable until merging starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    /// Whether task-level handlers may still mutate the batch.
    pub fn accepts_task_updates(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Running)
    }

    /// Cancellation is only honoured before the merge phase begins.
    pub fn is_cancellable(&self) -> bool {
        self.accepts_task_updates()
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Merging => "merging",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// State of a single task inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchTaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    /// A completed task whose merge conflicted under the `skip` policy
    Skipped,
    Cancelled,
}

impl BatchTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchTaskStatus::Queued | BatchTaskStatus::Running)
    }

    /// Whether moving from `self` to `next` follows the task state machine.
    ///
    /// `completed -> skipped` and `completed -> failed` only happen during the
    /// merge phase; the orchestrator is responsible for that restriction.
    pub fn can_transition_to(&self, next: BatchTaskStatus) -> bool {
        use BatchTaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Completed, Skipped)
                | (Completed, Failed)
        )
    }
}

impl fmt::Display for BatchTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchTaskStatus::Queued => "queued",
            BatchTaskStatus::Running => "running",
            BatchTaskStatus::Completed => "completed",
            BatchTaskStatus::Failed => "failed",
            BatchTaskStatus::Skipped => "skipped",
            BatchTaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// What to do when merging a task branch into the batch branch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Leave the conflicting task out and keep merging
    #[default]
    Skip,
    /// Stop the merge loop and fail the batch
    Fail,
}

/// Phase of a single-task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Cloning,
    Executing,
    Committing,
    CreatingPr,
    Done,
    Error,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Cloning => "cloning",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Committing => "committing",
            ExecutionStatus::CreatingPr => "creating_pr",
            ExecutionStatus::Done => "done",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Status column of a task record on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardTaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl BoardTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardTaskStatus::Todo => "todo",
            BoardTaskStatus::InProgress => "in_progress",
            BoardTaskStatus::Done => "done",
            BoardTaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todo" => Some(BoardTaskStatus::Todo),
            "in_progress" => Some(BoardTaskStatus::InProgress),
            "done" => Some(BoardTaskStatus::Done),
            "cancelled" => Some(BoardTaskStatus::Cancelled),
            _ => None,
        }
    }
}
