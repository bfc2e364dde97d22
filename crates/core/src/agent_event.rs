//! Agent Runtime Events
//!
//! The coding-agent runtime streams loosely shaped JSON events: the session
//! identifier lives in different places depending on the event type, and
//! payload fields are optional. Everything is decoded once, at ingress, into
//! the typed [`AgentEvent`] envelope so that downstream routing never probes
//! raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// Prefix carried by agent session identifiers.
pub const SESSION_ID_PREFIX: &str = "ses_";

/// An event exactly as received from the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

/// Busy/idle/retry status reported through `session.status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Busy,
    Idle,
    Retry { message: Option<String> },
    Other(String),
}

/// Lifecycle state of a tool call reported through a message part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolState {
    Pending,
    Running { title: Option<String> },
    Completed { output: Option<String> },
    Error { output: Option<String> },
}

/// Classified event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEventKind {
    Heartbeat,
    SessionIdle,
    SessionCompleted,
    SessionError { message: String },
    SessionStatus(SessionStatus),
    TextDelta(String),
    ReasoningDelta(String),
    ToolPart { tool: String, state: ToolState },
    ToolStarted { tool: String },
    ToolFinished { tool: String, output: Option<String> },
    FileEdited { file: String },
    /// Anything the router has no use for; keeps the raw type for tracing
    Other(String),
}

/// A decoded event, tagged with the session it belongs to (when known).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEvent {
    pub session_id: Option<String>,
    pub kind: AgentEventKind,
}

impl AgentEvent {
    pub fn new(session_id: impl Into<String>, kind: AgentEventKind) -> Self {
        Self {
            session_id: Some(session_id.into()),
            kind,
        }
    }

    /// Parse and decode one JSON payload from the event stream.
    pub fn from_json(data: &str) -> CoreResult<Self> {
        let raw: RawAgentEvent = serde_json::from_str(data)
            .map_err(|e| CoreError::parse(format!("invalid agent event: {}", e)))?;
        Ok(Self::decode(&raw))
    }

    pub fn decode(raw: &RawAgentEvent) -> Self {
        let props = &raw.properties;
        Self {
            session_id: extract_session_id(props),
            kind: classify(&raw.event_type, props),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.kind, AgentEventKind::Heartbeat)
    }
}

/// Locate the session identifier in an event's properties.
///
/// Lookup order: `sessionID`, `id` (session-prefixed), `info.sessionID`,
/// `info.id` (session-prefixed), `part.sessionID`, `session.id`.
pub fn extract_session_id(props: &Value) -> Option<String> {
    if let Some(id) = str_field(props, "sessionID") {
        return Some(id.to_string());
    }
    if let Some(id) = str_field(props, "id").filter(|id| id.starts_with(SESSION_ID_PREFIX)) {
        return Some(id.to_string());
    }
    if let Some(info) = props.get("info") {
        if let Some(id) = str_field(info, "sessionID") {
            return Some(id.to_string());
        }
        if let Some(id) = str_field(info, "id").filter(|id| id.starts_with(SESSION_ID_PREFIX)) {
            return Some(id.to_string());
        }
    }
    if let Some(id) = props.get("part").and_then(|p| str_field(p, "sessionID")) {
        return Some(id.to_string());
    }
    props
        .get("session")
        .and_then(|s| str_field(s, "id"))
        .map(str::to_string)
}

fn classify(event_type: &str, props: &Value) -> AgentEventKind {
    match event_type {
        "server.heartbeat" => AgentEventKind::Heartbeat,
        "session.idle" => AgentEventKind::SessionIdle,
        "session.completed" => AgentEventKind::SessionCompleted,
        "session.error" => AgentEventKind::SessionError {
            message: error_message(props.get("error")),
        },
        "session.status" => AgentEventKind::SessionStatus(session_status(props.get("status"))),
        "message.part.updated" => classify_part(props),
        "tool.execute.before" => match str_field(props, "tool") {
            Some(tool) => AgentEventKind::ToolStarted {
                tool: tool.to_string(),
            },
            None => AgentEventKind::Other(event_type.to_string()),
        },
        "tool.execute.after" => match str_field(props, "tool") {
            Some(tool) => AgentEventKind::ToolFinished {
                tool: tool.to_string(),
                output: str_field(props, "output").map(str::to_string),
            },
            None => AgentEventKind::Other(event_type.to_string()),
        },
        "file.edited" => match str_field(props, "file") {
            Some(file) => AgentEventKind::FileEdited {
                file: file.to_string(),
            },
            None => AgentEventKind::Other(event_type.to_string()),
        },
        other => AgentEventKind::Other(other.to_string()),
    }
}

fn classify_part(props: &Value) -> AgentEventKind {
    let part = props.get("part").unwrap_or(&Value::Null);
    let delta = str_field(props, "delta").filter(|d| !d.is_empty());

    match str_field(part, "type") {
        Some("text") => match delta {
            Some(d) => AgentEventKind::TextDelta(d.to_string()),
            None => AgentEventKind::Other("message.part.updated".to_string()),
        },
        Some("reasoning") => match delta {
            Some(d) => AgentEventKind::ReasoningDelta(d.to_string()),
            None => AgentEventKind::Other("message.part.updated".to_string()),
        },
        Some("tool") => {
            let tool = str_field(part, "tool").unwrap_or("unknown tool").to_string();
            let state = part.get("state").unwrap_or(&Value::Null);
            let output = str_field(state, "output").map(str::to_string);
            let state = match str_field(state, "status") {
                Some("running") => ToolState::Running {
                    title: str_field(state, "title").map(str::to_string),
                },
                Some("completed") => ToolState::Completed { output },
                Some("error") => ToolState::Error {
                    output: output.or_else(|| str_field(state, "error").map(str::to_string)),
                },
                _ => ToolState::Pending,
            };
            AgentEventKind::ToolPart { tool, state }
        }
        _ => AgentEventKind::Other("message.part.updated".to_string()),
    }
}

fn session_status(status: Option<&Value>) -> SessionStatus {
    let Some(status) = status else {
        return SessionStatus::Other(String::new());
    };
    match str_field(status, "type") {
        Some("busy") => SessionStatus::Busy,
        Some("idle") => SessionStatus::Idle,
        Some("retry") => SessionStatus::Retry {
            message: str_field(status, "message").map(str::to_string),
        },
        Some(other) => SessionStatus::Other(other.to_string()),
        None => SessionStatus::Other(String::new()),
    }
}

/// The runtime reports errors either as a plain string or as
/// `{ name, data: { message } }`.
fn error_message(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(obj @ Value::Object(_)) => obj
            .get("data")
            .and_then(|d| str_field(d, "message"))
            .or_else(|| str_field(obj, "message"))
            .or_else(|| str_field(obj, "name"))
            .unwrap_or("Session error")
            .to_string(),
        _ => "Session error".to_string(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
