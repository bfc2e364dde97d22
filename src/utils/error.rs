//! Error Handling
//!
//! Unified error types for the orchestrator.
//! Uses thiserror for ergonomic error definitions.

use board_runner_core::CoreError;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// A git subprocess exited non-zero (output already redacted and truncated)
    #[error("Git operation failed: `{command}`: {output}")]
    GitOperationFailed { command: String, output: String },

    /// The agent runtime could not create a session
    #[error("Failed to create agent session: {0}")]
    SessionCreationFailed(String),

    /// The agent runtime rejected or failed to accept a prompt
    #[error("Failed to send prompt: {0}")]
    PromptSendFailed(String),

    /// Too many single-task executions are already running
    #[error("Parallel limit reached ({0} tasks max)")]
    ParallelLimitReached(usize),

    /// No repository is configured for the caller
    #[error("No active project selected")]
    NoActiveRepository,

    /// `approve_next_task` was called with nothing left to approve
    #[error("No queued tasks to approve")]
    NoQueuedTasks,

    /// The agent event stream broke; callers resubscribe after a backoff
    #[error("Agent event stream disconnected: {0}")]
    EventStreamDisconnected(String),

    /// The task already has a live execution
    #[error("Task is already running: {0}")]
    AlreadyRunning(String),

    /// The task already belongs to a live batch or execution
    #[error("Task {task_id} is already claimed by {owner}")]
    TaskClaimed { task_id: String, owner: String },

    /// The task has no live execution
    #[error("Task is not running: {0}")]
    NotRunning(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Errors from the shared core crate
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a git failure
    pub fn git(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::GitOperationFailed {
            command: command.into(),
            output: output.into(),
        }
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure looks like a rejected provider credential.
    pub fn is_auth_related(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("api key") || msg.contains("unauthorized") || msg.contains("401")
    }

    /// Short user-facing headline for agent runtime failures.
    pub fn user_hint(&self) -> &'static str {
        if self.is_auth_related() {
            "Invalid API key: update it in Settings → AI Providers"
        } else {
            "Failed to send prompt to agent"
        }
    }
}

/// Convert AppError to a string suitable for API responses
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}
