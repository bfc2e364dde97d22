//! Agent Runtime
//!
//! Session API of the remote coding-agent runtime: create a session scoped
//! to a working directory, send a prompt, abort, and subscribe to the shared
//! event stream.

mod http;
mod sse;

use std::fmt;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use board_runner_core::AgentEvent;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::utils::error::AppResult;

pub use http::HttpAgentRuntime;
pub use sse::agent_event_stream;

/// Decoded events from the runtime. Heartbeats are already filtered out; an
/// `Err` item means the connection broke and the caller should resubscribe.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = AppResult<AgentEvent>> + Send>>;

/// Model override sent with a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    /// Split `provider/model` at the first `/`. Returns `None` when either
    /// half is missing.
    pub fn parse(spec: &str) -> Option<Self> {
        let (provider, model) = spec.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start a session bound to `directory`; returns the session id.
    async fn create_session(&self, directory: &Path, title: &str) -> AppResult<String>;

    /// Send the task prompt. May not return until the agent has replied, so
    /// callers run it in a supervised background task.
    async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        model: Option<&ModelRef>,
    ) -> AppResult<()>;

    async fn abort_session(&self, session_id: &str) -> AppResult<()>;

    /// Open a new subscription to the runtime-wide event stream.
    async fn subscribe_events(&self) -> AppResult<AgentEventStream>;

    /// Configured default model (`provider/model`), if any.
    async fn current_model(&self) -> AppResult<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ref_parse() {
        let model = ModelRef::parse("anthropic/claude-sonnet-4/latest").unwrap();
        assert_eq!(model.provider_id, "anthropic");
        assert_eq!(model.model_id, "claude-sonnet-4/latest");
        assert_eq!(model.to_string(), "anthropic/claude-sonnet-4/latest");

        assert!(ModelRef::parse("gpt-4o").is_none());
        assert!(ModelRef::parse("/gpt-4o").is_none());
        assert!(ModelRef::parse("openai/").is_none());
    }

    #[test]
    fn test_model_ref_wire_format() {
        let model = ModelRef::parse("openai/gpt-4o").unwrap();
        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["providerID"], "openai");
        assert_eq!(json["modelID"], "gpt-4o");
    }
}
