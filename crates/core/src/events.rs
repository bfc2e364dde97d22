//! Board Events
//!
//! Named lifecycle, progress and log events pushed to board clients through
//! the broadcast transport.

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::status::{BatchMode, BatchStatus, BatchTaskStatus, BoardTaskStatus, ExecutionStatus};

/// Minimal per-task view included in batch lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTaskBrief {
    pub task_id: String,
    pub title: String,
    pub status: BatchTaskStatus,
}

/// Execution-progress payload for the single-task path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_compare_link: Option<bool>,
}

impl ExecutionProgress {
    pub fn new(task_id: impl Into<String>, status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            message: message.into(),
            elapsed_ms: None,
            estimated_progress: None,
            pr_url: None,
            is_compare_link: None,
        }
    }
}

/// Durable-record change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskChange {
    pub task_id: String,
    pub status: BoardTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

/// Every event the orchestrator publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum BoardEvent {
    #[serde(rename = "batch:created")]
    BatchCreated {
        batch_id: String,
        mode: BatchMode,
        status: BatchStatus,
        tasks: Vec<BatchTaskBrief>,
    },
    #[serde(rename = "batch:started")]
    BatchStarted {
        batch_id: String,
        mode: BatchMode,
        tasks: Vec<BatchTaskBrief>,
    },
    #[serde(rename = "batch:task:started")]
    BatchTaskStarted {
        batch_id: String,
        task_id: String,
        title: String,
    },
    #[serde(rename = "batch:task:completed")]
    BatchTaskCompleted { batch_id: String, task_id: String },
    #[serde(rename = "batch:task:failed")]
    BatchTaskFailed {
        batch_id: String,
        task_id: String,
        error: String,
    },
    #[serde(rename = "batch:task:skipped")]
    BatchTaskSkipped { batch_id: String, task_id: String },
    #[serde(rename = "batch:task:cancelled")]
    BatchTaskCancelled { batch_id: String, task_id: String },
    #[serde(rename = "batch:merging")]
    BatchMerging { batch_id: String },
    #[serde(rename = "batch:completed")]
    BatchCompleted {
        batch_id: String,
        pr_url: Option<String>,
    },
    #[serde(rename = "batch:failed")]
    BatchFailed { batch_id: String },
    #[serde(rename = "batch:cancelled")]
    BatchCancelled { batch_id: String },
    #[serde(rename = "execution:progress")]
    ExecutionProgress(ExecutionProgress),
    #[serde(rename = "execution:log")]
    ExecutionLog { task_id: String, entry: LogEntry },
    #[serde(rename = "task:updated")]
    TaskUpdated(TaskChange),
}

impl BoardEvent {
    /// Channel name the event is published under.
    pub fn name(&self) -> &'static str {
        match self {
            BoardEvent::BatchCreated { .. } => "batch:created",
            BoardEvent::BatchStarted { .. } => "batch:started",
            BoardEvent::BatchTaskStarted { .. } => "batch:task:started",
            BoardEvent::BatchTaskCompleted { .. } => "batch:task:completed",
            BoardEvent::BatchTaskFailed { .. } => "batch:task:failed",
            BoardEvent::BatchTaskSkipped { .. } => "batch:task:skipped",
            BoardEvent::BatchTaskCancelled { .. } => "batch:task:cancelled",
            BoardEvent::BatchMerging { .. } => "batch:merging",
            BoardEvent::BatchCompleted { .. } => "batch:completed",
            BoardEvent::BatchFailed { .. } => "batch:failed",
            BoardEvent::BatchCancelled { .. } => "batch:cancelled",
            BoardEvent::ExecutionProgress(_) => "execution:progress",
            BoardEvent::ExecutionLog { .. } => "execution:log",
            BoardEvent::TaskUpdated(_) => "task:updated",
        }
    }

    /// Batch the event belongs to, if it is a batch lifecycle event.
    pub fn batch_id(&self) -> Option<&str> {
        match self {
            BoardEvent::BatchCreated { batch_id, .. }
            | BoardEvent::BatchStarted { batch_id, .. }
            | BoardEvent::BatchTaskStarted { batch_id, .. }
            | BoardEvent::BatchTaskCompleted { batch_id, .. }
            | BoardEvent::BatchTaskFailed { batch_id, .. }
            | BoardEvent::BatchTaskSkipped { batch_id, .. }
            | BoardEvent::BatchTaskCancelled { batch_id, .. }
            | BoardEvent::BatchMerging { batch_id }
            | BoardEvent::BatchCompleted { batch_id, .. }
            | BoardEvent::BatchFailed { batch_id }
            | BoardEvent::BatchCancelled { batch_id } => Some(batch_id),
            _ => None,
        }
    }

    /// Task the event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            BoardEvent::BatchTaskStarted { task_id, .. }
            | BoardEvent::BatchTaskCompleted { task_id, .. }
            | BoardEvent::BatchTaskFailed { task_id, .. }
            | BoardEvent::BatchTaskSkipped { task_id, .. }
            | BoardEvent::BatchTaskCancelled { task_id, .. }
            | BoardEvent::ExecutionLog { task_id, .. } => Some(task_id),
            BoardEvent::ExecutionProgress(p) => Some(&p.task_id),
            BoardEvent::TaskUpdated(change) => Some(&change.task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = BoardEvent::BatchTaskFailed {
            batch_id: "b1".to_string(),
            task_id: "t1".to_string(),
            error: "Merge conflict".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "batch:task:failed");
        assert_eq!(json["data"]["batchId"], "b1");
        assert_eq!(json["data"]["taskId"], "t1");
        assert_eq!(event.name(), "batch:task:failed");
    }

    #[test]
    fn test_progress_event_omits_empty_fields() {
        let event = BoardEvent::ExecutionProgress(ExecutionProgress::new(
            "t1",
            ExecutionStatus::Cloning,
            "Cloning repository...",
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "execution:progress");
        assert_eq!(json["data"]["status"], "cloning");
        assert!(json["data"].get("prUrl").is_none());
        assert_eq!(event.task_id(), Some("t1"));
        assert_eq!(event.batch_id(), None);
    }

    #[test]
    fn test_batch_id_accessor() {
        let event = BoardEvent::BatchMerging {
            batch_id: "b9".to_string(),
        };
        assert_eq!(event.batch_id(), Some("b9"));
        assert_eq!(event.task_id(), None);
    }
}
