//! Event stream parsing
//!
//! Turns the runtime's `text/event-stream` body into decoded agent events.

use std::collections::VecDeque;
use std::pin::Pin;

use board_runner_core::AgentEvent;
use futures_util::{Stream, StreamExt};
use tracing::debug;

use crate::utils::error::{AppError, AppResult};

/// Parse a raw byte stream into decoded agent events.
///
/// Buffers incoming chunks, splits on newlines and decodes each `data:` line.
/// Heartbeats and undecodable payloads are dropped; a transport error is
/// yielded once as `EventStreamDisconnected`.
pub fn agent_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = AppResult<AgentEvent>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseParserState {
        inner: Box::pin(byte_stream),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if let Some(event) = state.pending.pop_front() {
            return Some((Ok(event), state));
        }
        if state.done {
            return None;
        }

        loop {
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(pos) = state.buffer.find('\n') {
                        let line: String = state.buffer.drain(..=pos).collect();
                        if let Some(event) = parse_sse_line(&line) {
                            state.pending.push_back(event);
                        }
                    }

                    if let Some(event) = state.pending.pop_front() {
                        return Some((Ok(event), state));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(AppError::EventStreamDisconnected(e.to_string())),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    let remaining = std::mem::take(&mut state.buffer);
                    return parse_sse_line(&remaining).map(|event| (Ok(event), state));
                }
            }
        }
    })
}

struct SseParserState<E> {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, E>> + Send>>,
    buffer: String,
    pending: VecDeque<AgentEvent>,
    done: bool,
}

/// Decode one SSE line. `None` for blank lines, comments, non-data fields,
/// heartbeats and payloads that are not agent events.
fn parse_sse_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed.strip_prefix("data:")?.trim_start();
    match AgentEvent::from_json(data) {
        Ok(event) if event.is_heartbeat() => None,
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, "skipping undecodable event");
            None
        }
    }
}
