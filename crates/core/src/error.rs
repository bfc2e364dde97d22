//! Core Error Types
//!
//! Errors raised while decoding or validating the shared vocabulary. The
//! application crate wraps these in its own error type alongside git, agent
//! runtime and storage failures.

use thiserror::Error;

/// Core error type for the Board Runner workspace.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed input from an external producer (agent events, stored JSON)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Value outside its allowed domain
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
