//! Task Log Entries
//!
//! Human-facing log lines attached to a running task. These are distinct from
//! process logs: they are broadcast to board clients and, for single-task
//! executions, persisted onto the task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters kept in [`LogEntry::details`].
pub const MAX_LOG_DETAILS_CHARS: usize = 2000;

/// Category of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Agent,
    Tool,
    Error,
    Success,
}

/// A single task-facing log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogKind::Info, message)
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(LogKind::Agent, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(LogKind::Tool, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogKind::Error, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogKind::Success, message)
    }

    /// Attach a details blob, capped at [`MAX_LOG_DETAILS_CHARS`].
    ///
    /// Empty details are dropped.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        if details.is_empty() {
            return self;
        }
        self.details = Some(match details.char_indices().nth(MAX_LOG_DETAILS_CHARS) {
            Some((idx, _)) => details[..idx].to_string(),
            None => details,
        });
        self
    }

    pub fn with_optional_details(self, details: Option<impl Into<String>>) -> Self {
        match details {
            Some(d) => self.with_details(d),
            None => self,
        }
    }
}
