//! HTTP Agent Runtime
//!
//! Talks to the runtime's REST session API and its `/event` SSE endpoint.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{agent_event_stream, AgentEventStream, AgentRuntime, ModelRef};
use crate::utils::error::{AppError, AppResult};
use crate::utils::text::{truncate_chars, MAX_ERROR_OUTPUT_CHARS};

/// Timeout for short control calls (create, abort, config)
const CONTROL_TIMEOUT_SECS: u64 = 30;

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeConfig {
    #[serde(default)]
    model: Option<String>,
}

/// [`AgentRuntime`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentRuntime {
    pub fn new(base_url: impl Into<String>) -> AppResult<Self> {
        // No overall timeout: prompts and the event stream are long-lived.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Render a non-success response as `"<status>: <body>"`, truncated.
async fn describe_failure(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let text = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    truncate_chars(&text, MAX_ERROR_OUTPUT_CHARS)
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn create_session(&self, directory: &Path, title: &str) -> AppResult<String> {
        let directory = directory.to_string_lossy();
        let response = self
            .client
            .post(self.url("/session"))
            .query(&[("directory", directory.as_ref())])
            .json(&json!({ "title": title }))
            .timeout(Duration::from_secs(CONTROL_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| AppError::SessionCreationFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::SessionCreationFailed(
                describe_failure(response).await,
            ));
        }

        let session: SessionInfo = response
            .json()
            .await
            .map_err(|e| AppError::SessionCreationFailed(format!("invalid session response: {}", e)))?;
        info!(session_id = %session.id, %directory, "agent session created");
        Ok(session.id)
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        model: Option<&ModelRef>,
    ) -> AppResult<()> {
        let mut body = json!({
            "parts": [{ "type": "text", "text": text }],
        });
        if let Some(model) = model {
            body["model"] = serde_json::to_value(model)?;
        }

        let response = self
            .client
            .post(self.url(&format!("/session/{}/message", session_id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::PromptSendFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::PromptSendFailed(describe_failure(response).await));
        }
        debug!(session_id, "prompt accepted");
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> AppResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/session/{}/abort", session_id)))
            .timeout(Duration::from_secs(CONTROL_TIMEOUT_SECS))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::internal(format!(
                "abort failed: {}",
                describe_failure(response).await
            )));
        }
        Ok(())
    }

    async fn subscribe_events(&self) -> AppResult<AgentEventStream> {
        let response = self
            .client
            .get(self.url("/event"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| AppError::EventStreamDisconnected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::EventStreamDisconnected(
                describe_failure(response).await,
            ));
        }

        Ok(Box::pin(agent_event_stream(response.bytes_stream())))
    }

    async fn current_model(&self) -> AppResult<Option<String>> {
        let response = self
            .client
            .get(self.url("/config"))
            .timeout(Duration::from_secs(CONTROL_TIMEOUT_SECS))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::internal(format!(
                "config read failed: {}",
                describe_failure(response).await
            )));
        }
        let config: RuntimeConfig = response.json().await?;
        Ok(config.model.filter(|m| !m.trim().is_empty()))
    }
}
