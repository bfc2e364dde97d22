//! Board Runner Core
//!
//! Shared vocabulary for the Board Runner workspace: status enums, task log
//! entries, the typed agent event envelope and the events published to board
//! clients. This crate has no dependencies on git, HTTP, storage or the async
//! runtime.
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `status` - Batch, task and execution lifecycle states
//! - `log` - Task-facing log entries (`LogEntry`, `LogKind`)
//! - `agent_event` - Decoding of raw agent runtime events into `AgentEvent`
//! - `events` - Broadcast event vocabulary (`BoardEvent`)

pub mod agent_event;
pub mod error;
pub mod events;
pub mod log;
pub mod status;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Lifecycle States ───────────────────────────────────────────────────
pub use status::{
    BatchMode, BatchStatus, BatchTaskStatus, BoardTaskStatus, ConflictPolicy, ExecutionStatus,
};

// ── Task Logs ──────────────────────────────────────────────────────────
pub use log::{LogEntry, LogKind, MAX_LOG_DETAILS_CHARS};

// ── Agent Events ───────────────────────────────────────────────────────
pub use agent_event::{
    extract_session_id, AgentEvent, AgentEventKind, RawAgentEvent, SessionStatus, ToolState,
};

// ── Board Events ───────────────────────────────────────────────────────
pub use events::{BatchTaskBrief, BoardEvent, ExecutionProgress, TaskChange};
