//! Agent Event Router
//!
//! One listener per attached session reads the runtime event stream, keeps
//! the events addressed to that session and turns them into task log lines,
//! activity counters and exactly one terminal outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use board_runner_core::{AgentEvent, AgentEventKind, LogEntry, SessionStatus, ToolState};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delta_buffer::DeltaBuffer;
use crate::services::runtime::{AgentEventStream, AgentRuntime};
use crate::utils::text::take_chars;

/// Tool output kept in a log entry's details
const TOOL_OUTPUT_PREVIEW_CHARS: usize = 100;

/// Non-terminal signals worth counting or displaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Thinking,
    ToolRunning(String),
    ToolExecuted,
    FileEdited,
}

/// How the agent session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed(String),
}

/// Receives the routed output of a session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    fn log(&self, task_id: &str, entry: LogEntry);

    fn on_activity(&self, _task_id: &str, _activity: Activity) {}

    /// Called at most once per attachment.
    async fn on_terminal(&self, task_id: &str, outcome: SessionOutcome);
}

struct Route {
    session_id: String,
    prompt_acknowledged: bool,
    terminal: bool,
    cancel: CancellationToken,
}

enum Claim {
    Claimed,
    AlreadyTerminal,
    NotAcknowledged,
    Detached,
}

/// Routes runtime events to the task that owns the session
#[derive(Clone)]
pub struct AgentEventRouter {
    runtime: Arc<dyn AgentRuntime>,
    buffer: DeltaBuffer,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    retry_delay: Duration,
}

impl AgentEventRouter {
    pub fn new(runtime: Arc<dyn AgentRuntime>, flush_delay: Duration, retry_delay: Duration) -> Self {
        Self {
            runtime,
            buffer: DeltaBuffer::new(flush_delay),
            routes: Arc::new(Mutex::new(HashMap::new())),
            retry_delay,
        }
    }

    pub fn buffer(&self) -> &DeltaBuffer {
        &self.buffer
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the event stream and start routing `session_id` events
    /// to `handler`. The first subscription is opened before this returns, so
    /// a prompt sent afterwards cannot outrun it.
    pub async fn attach(&self, task_id: &str, session_id: &str, handler: Arc<dyn SessionHandler>) {
        let emit_handler = handler.clone();
        let emit_task = task_id.to_string();
        self.buffer.register(
            task_id,
            Arc::new(move |entry| emit_handler.log(&emit_task, entry)),
        );

        let cancel = CancellationToken::new();
        let previous = self.routes().insert(
            task_id.to_string(),
            Route {
                session_id: session_id.to_string(),
                prompt_acknowledged: false,
                terminal: false,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let stream = match self.runtime.subscribe_events().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(task_id, session_id, error = %e, "event subscription failed, will retry");
                handler.log(
                    task_id,
                    LogEntry::error("Failed to subscribe to agent events").with_details(e.to_string()),
                );
                None
            }
        };

        info!(task_id, session_id, "routing agent events");
        let router = self.clone();
        let task_id = task_id.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            router
                .listen(task_id, session_id, handler, cancel, stream)
                .await;
        });
    }

    async fn listen(
        self,
        task_id: String,
        session_id: String,
        handler: Arc<dyn SessionHandler>,
        cancel: CancellationToken,
        mut stream: Option<AgentEventStream>,
    ) {
        loop {
            let Some(events) = stream.as_mut() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
                match self.runtime.subscribe_events().await {
                    Ok(resubscribed) => {
                        info!(%task_id, %session_id, "resubscribed to agent events");
                        stream = Some(resubscribed);
                    }
                    Err(e) => warn!(%task_id, error = %e, "resubscribe failed"),
                }
                continue;
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if event.session_id.as_deref() == Some(session_id.as_str()) {
                        self.dispatch(&task_id, handler.as_ref(), event).await;
                    }
                }
                Some(Err(e)) => {
                    warn!(%task_id, error = %e, "agent event stream error");
                    stream = None;
                }
                None => {
                    warn!(%task_id, "agent event stream ended");
                    stream = None;
                }
            }
        }
        debug!(%task_id, "event listener stopped");
    }

    async fn dispatch(&self, task_id: &str, handler: &dyn SessionHandler, event: AgentEvent) {
        match event.kind {
            AgentEventKind::SessionIdle | AgentEventKind::SessionCompleted => {
                match self.claim(task_id, true) {
                    Claim::Claimed => {
                        self.buffer.flush(task_id);
                        handler.log(task_id, LogEntry::success("Agent completed work"));
                        handler.on_terminal(task_id, SessionOutcome::Completed).await;
                    }
                    Claim::NotAcknowledged => {
                        debug!(task_id, "ignoring idle before prompt was acknowledged");
                    }
                    Claim::AlreadyTerminal | Claim::Detached => {}
                }
            }
            AgentEventKind::SessionError { message } => {
                if let Claim::Claimed = self.claim(task_id, false) {
                    self.buffer.flush(task_id);
                    handler.log(
                        task_id,
                        LogEntry::error("Execution failed").with_details(message.clone()),
                    );
                    handler
                        .on_terminal(task_id, SessionOutcome::Failed(message))
                        .await;
                }
            }
            AgentEventKind::SessionStatus(SessionStatus::Busy) => {
                self.acknowledge_prompt(task_id);
                if self.buffer.mark_thinking(task_id) {
                    handler.log(task_id, LogEntry::agent("Agent is thinking..."));
                }
                handler.on_activity(task_id, Activity::Thinking);
            }
            AgentEventKind::SessionStatus(SessionStatus::Retry { message }) => {
                handler.log(
                    task_id,
                    LogEntry::info(format!(
                        "Retrying: {}",
                        message.as_deref().unwrap_or("unknown reason")
                    )),
                );
            }
            AgentEventKind::TextDelta(delta) => self.buffer.append_text(task_id, &delta),
            AgentEventKind::ReasoningDelta(delta) => {
                self.buffer.flush_text(task_id);
                self.buffer.append_reasoning(task_id, &delta);
            }
            AgentEventKind::ToolPart { tool, state } => {
                self.buffer.flush(task_id);
                match state {
                    ToolState::Running { title } => {
                        let label = title.unwrap_or_else(|| tool.clone());
                        handler.log(task_id, LogEntry::tool(format!("Running: {}", label)));
                        handler.on_activity(task_id, Activity::ToolRunning(label));
                    }
                    ToolState::Completed { output } => handler.log(
                        task_id,
                        LogEntry::success(format!("Completed: {}", tool)).with_optional_details(
                            output.map(|o| take_chars(&o, TOOL_OUTPUT_PREVIEW_CHARS).to_string()),
                        ),
                    ),
                    ToolState::Error { output } => handler.log(
                        task_id,
                        LogEntry::error(format!("Failed: {}", tool)).with_optional_details(output),
                    ),
                    ToolState::Pending => {}
                }
            }
            AgentEventKind::ToolStarted { tool } => {
                self.buffer.flush(task_id);
                handler.log(task_id, LogEntry::tool(format!("Starting: {}", tool)));
            }
            AgentEventKind::ToolFinished { tool, output } => {
                handler.on_activity(task_id, Activity::ToolExecuted);
                handler.log(
                    task_id,
                    LogEntry::success(format!("Finished: {}", tool)).with_optional_details(
                        output.map(|o| take_chars(&o, TOOL_OUTPUT_PREVIEW_CHARS).to_string()),
                    ),
                );
            }
            AgentEventKind::FileEdited { file } => {
                self.buffer.flush(task_id);
                handler.on_activity(task_id, Activity::FileEdited);
                handler.log(task_id, LogEntry::success(format!("Edited file: {}", file)));
            }
            AgentEventKind::SessionStatus(_)
            | AgentEventKind::Heartbeat
            | AgentEventKind::Other(_) => {}
        }
    }

    fn claim(&self, task_id: &str, require_ack: bool) -> Claim {
        let mut routes = self.routes();
        let Some(route) = routes.get_mut(task_id) else {
            return Claim::Detached;
        };
        if route.terminal {
            Claim::AlreadyTerminal
        } else if require_ack && !route.prompt_acknowledged {
            Claim::NotAcknowledged
        } else {
            route.terminal = true;
            Claim::Claimed
        }
    }

    /// Record that the runtime has taken the prompt; idle events count from now on.
    pub fn acknowledge_prompt(&self, task_id: &str) {
        if let Some(route) = self.routes().get_mut(task_id) {
            route.prompt_acknowledged = true;
        }
    }

    /// Claim the terminal outcome for a path outside the event stream
    /// (cancel, timeout, prompt failure). Returns `false` if the session
    /// already ended.
    pub fn mark_terminal(&self, task_id: &str) -> bool {
        match self.routes().get_mut(task_id) {
            Some(route) if route.terminal => false,
            Some(route) => {
                route.terminal = true;
                true
            }
            None => true,
        }
    }

    pub fn is_attached(&self, task_id: &str) -> bool {
        self.routes().contains_key(task_id)
    }

    pub fn session_for(&self, task_id: &str) -> Option<String> {
        self.routes().get(task_id).map(|r| r.session_id.clone())
    }

    /// Release the task only while its route still belongs to `session_id`.
    /// Returns whether anything was released.
    pub fn detach(&self, task_id: &str, session_id: &str) -> bool {
        let route = {
            let mut routes = self.routes();
            match routes.get(task_id) {
                Some(route) if route.session_id == session_id => routes.remove(task_id),
                _ => None,
            }
        };
        let Some(route) = route else {
            return false;
        };
        route.cancel.cancel();
        self.buffer.flush(task_id);
        self.buffer.cleanup(task_id);
        debug!(task_id, session_id, "route detached");
        true
    }

    /// Flush buffered output, stop the listener and forget the task.
    pub fn release(&self, task_id: &str) {
        self.buffer.flush(task_id);
        self.buffer.cleanup(task_id);
        if let Some(route) = self.routes().remove(task_id) {
            route.cancel.cancel();
            debug!(task_id, session_id = %route.session_id, "route released");
        }
    }
}

impl std::fmt::Debug for AgentEventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEventRouter")
            .field("routes", &self.routes().len())
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}
