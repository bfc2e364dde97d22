//! Board Records
//!
//! Durable task, project and repository records as the orchestrator sees them,
//! plus the partial update applied to a task record.

use std::path::PathBuf;

use board_runner_core::{BoardTaskStatus, LogEntry, TaskChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A card on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: BoardTaskStatus,
    pub project_id: Option<String>,
    pub batch_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub execution_paused_at: Option<DateTime<Utc>>,
    pub execution_elapsed_ms: Option<u64>,
    pub execution_progress: Option<u8>,
    pub pr_url: Option<String>,
    pub outcome: Option<String>,
    #[serde(default)]
    pub execution_logs: Vec<LogEntry>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: BoardTaskStatus::Todo,
            project_id: None,
            batch_id: None,
            session_id: None,
            labels: Vec::new(),
            execution_started_at: None,
            execution_paused_at: None,
            execution_elapsed_ms: None,
            execution_progress: None,
            pr_url: None,
            outcome: None,
            execution_logs: Vec::new(),
        }
    }

    /// Prompt text sent to the agent: title, description and labels.
    pub fn prompt(&self, include_labels: bool) -> String {
        let mut prompt = self.title.clone();
        if let Some(description) = self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(description);
        }
        if include_labels && !self.labels.is_empty() {
            prompt.push_str("\n\nLabels: ");
            prompt.push_str(&self.labels.join(", "));
        }
        prompt
    }

    /// Broadcast payload describing this record.
    pub fn change(&self) -> TaskChange {
        TaskChange {
            task_id: self.id.clone(),
            status: self.status,
            progress: self.execution_progress,
            pr_url: self.pr_url.clone(),
            outcome: self.outcome.clone(),
            batch_id: self.batch_id.clone(),
        }
    }
}

/// A hosted repository the agent works against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    /// `owner/repo`
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub is_active: bool,
}

impl Repository {
    /// Split `full_name` into owner and repository name.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        self.full_name
            .split_once('/')
            .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
    }
}

/// Grouping of tasks; may pin a repository or a local checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repository_id: Option<String>,
    pub local_path: Option<PathBuf>,
}

/// Partial update of a task record. `None` leaves a column untouched; the
/// inner `Option` of nullable columns distinguishes "clear" from "set".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<BoardTaskStatus>,
    pub session_id: Option<Option<String>>,
    pub batch_id: Option<Option<String>>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub execution_paused_at: Option<Option<DateTime<Utc>>>,
    pub execution_elapsed_ms: Option<u64>,
    pub execution_progress: Option<Option<u8>>,
    pub pr_url: Option<Option<String>>,
    pub outcome: Option<Option<String>>,
    pub execution_logs: Option<Vec<LogEntry>>,
}

impl TaskUpdate {
    pub fn status(status: BoardTaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn session(mut self, session_id: Option<String>) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn batch(mut self, batch_id: Option<String>) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.execution_started_at = Some(at);
        self
    }

    pub fn paused_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.execution_paused_at = Some(at);
        self
    }

    pub fn elapsed_ms(mut self, ms: u64) -> Self {
        self.execution_elapsed_ms = Some(ms);
        self
    }

    pub fn progress(mut self, progress: Option<u8>) -> Self {
        self.execution_progress = Some(progress);
        self
    }

    pub fn pr_url(mut self, url: Option<String>) -> Self {
        self.pr_url = Some(url);
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(Some(outcome.into()));
        self
    }

    pub fn logs(mut self, logs: Vec<LogEntry>) -> Self {
        self.execution_logs = Some(logs);
        self
    }

    /// Apply the update to an in-memory record.
    pub fn apply_to(self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(session_id) = self.session_id {
            record.session_id = session_id;
        }
        if let Some(batch_id) = self.batch_id {
            record.batch_id = batch_id;
        }
        if let Some(at) = self.execution_started_at {
            record.execution_started_at = Some(at);
        }
        if let Some(at) = self.execution_paused_at {
            record.execution_paused_at = at;
        }
        if let Some(ms) = self.execution_elapsed_ms {
            record.execution_elapsed_ms = Some(ms);
        }
        if let Some(progress) = self.execution_progress {
            record.execution_progress = progress;
        }
        if let Some(url) = self.pr_url {
            record.pr_url = url;
        }
        if let Some(outcome) = self.outcome {
            record.outcome = outcome;
        }
        if let Some(logs) = self.execution_logs {
            record.execution_logs = logs;
        }
    }
}
