//! Delta Buffer
//!
//! The runtime streams agent output token by token. Per task, two
//! accumulators (plain text and reasoning) collect the fragments and each
//! emits one log line after a quiet period, or immediately on a forced flush.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use board_runner_core::LogEntry;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::utils::text::take_chars;

/// Buffered text longer than this is dropped instead of logged
pub const MAX_TEXT_LINE_CHARS: usize = 500;

/// Reasoning lines keep only this many characters
pub const MAX_REASONING_PREVIEW_CHARS: usize = 200;

/// Receives the reassembled log lines of one task.
pub type LogEmitter = Arc<dyn Fn(LogEntry) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Text,
    Reasoning,
}

#[derive(Default)]
struct Accumulator {
    content: String,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every append so a superseded timer that already woke is a no-op
    generation: u64,
}

impl Accumulator {
    fn take(&mut self) -> String {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.content)
    }
}

struct TaskBuffer {
    text: Accumulator,
    reasoning: Accumulator,
    /// "Agent is thinking..." already logged for the current stretch
    thinking: bool,
    emit: LogEmitter,
}

impl TaskBuffer {
    fn channel(&mut self, channel: Channel) -> &mut Accumulator {
        match channel {
            Channel::Text => &mut self.text,
            Channel::Reasoning => &mut self.reasoning,
        }
    }
}

/// Per-task debounced accumulators for streamed agent output
#[derive(Clone)]
pub struct DeltaBuffer {
    delay: Duration,
    buffers: Arc<Mutex<HashMap<String, TaskBuffer>>>,
}

impl DeltaBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give the task a fresh buffer bound to `emit`. A buffer left over from
    /// an earlier attachment is discarded along with its pending output.
    /// Appends for unregistered tasks are dropped.
    pub fn register(&self, task_id: &str, emit: LogEmitter) {
        let mut fresh = TaskBuffer {
            text: Accumulator::default(),
            reasoning: Accumulator::default(),
            thinking: false,
            emit,
        };
        let mut buffers = self.lock();
        if let Some(mut stale) = buffers.remove(task_id) {
            trace!(task_id, "replacing stale delta buffer");
            stale.text.take();
            stale.reasoning.take();
            // a stale timer that already woke must not match the new generations
            fresh.text.generation = stale.text.generation;
            fresh.reasoning.generation = stale.reasoning.generation;
        }
        buffers.insert(task_id.to_string(), fresh);
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn append_text(&self, task_id: &str, delta: &str) {
        self.append(task_id, Channel::Text, delta);
    }

    pub fn append_reasoning(&self, task_id: &str, delta: &str) {
        self.append(task_id, Channel::Reasoning, delta);
    }

    fn append(&self, task_id: &str, channel: Channel, delta: &str) {
        let mut buffers = self.lock();
        let Some(buffer) = buffers.get_mut(task_id) else {
            trace!(task_id, "delta for unregistered task dropped");
            return;
        };
        if channel == Channel::Text {
            buffer.thinking = false;
        }

        let acc = buffer.channel(channel);
        acc.content.push_str(delta);
        acc.generation += 1;
        if let Some(timer) = acc.timer.take() {
            timer.abort();
        }

        let this = self.clone();
        let task = task_id.to_string();
        let generation = acc.generation;
        let delay = self.delay;
        acc.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(&task, channel, generation);
        }));
    }

    fn fire(&self, task_id: &str, channel: Channel, generation: u64) {
        let (content, emit) = {
            let mut buffers = self.lock();
            let Some(buffer) = buffers.get_mut(task_id) else {
                return;
            };
            let emit = buffer.emit.clone();
            let acc = buffer.channel(channel);
            if acc.generation != generation {
                return;
            }
            // the running timer is this task; drop the handle instead of aborting it
            acc.timer = None;
            (std::mem::take(&mut acc.content), emit)
        };
        if let Some(entry) = render(channel, &content) {
            emit(entry);
        }
    }

    /// Flush both accumulators now, text first.
    pub fn flush(&self, task_id: &str) {
        self.flush_channels(task_id, &[Channel::Text, Channel::Reasoning]);
    }

    /// Flush only pending plain text.
    pub fn flush_text(&self, task_id: &str) {
        self.flush_channels(task_id, &[Channel::Text]);
    }

    fn flush_channels(&self, task_id: &str, channels: &[Channel]) {
        let (pending, emit) = {
            let mut buffers = self.lock();
            let Some(buffer) = buffers.get_mut(task_id) else {
                return;
            };
            let emit = buffer.emit.clone();
            let pending: Vec<_> = channels
                .iter()
                .map(|&channel| (channel, buffer.channel(channel).take()))
                .collect();
            (pending, emit)
        };
        for (channel, content) in pending {
            if let Some(entry) = render(channel, &content) {
                emit(entry);
            }
        }
    }

    /// Returns `true` the first time it is called in a thinking stretch.
    /// Appending plain text ends the stretch.
    pub fn mark_thinking(&self, task_id: &str) -> bool {
        match self.lock().get_mut(task_id) {
            Some(buffer) if !buffer.thinking => {
                buffer.thinking = true;
                true
            }
            _ => false,
        }
    }

    /// Cancel timers and drop the task's buffer without emitting.
    pub fn cleanup(&self, task_id: &str) {
        if let Some(mut buffer) = self.lock().remove(task_id) {
            buffer.text.take();
            buffer.reasoning.take();
        }
    }
}

impl std::fmt::Debug for DeltaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaBuffer")
            .field("delay", &self.delay)
            .field("tasks", &self.lock().len())
            .finish()
    }
}

fn render(channel: Channel, content: &str) -> Option<LogEntry> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    match channel {
        Channel::Text if trimmed.chars().count() >= MAX_TEXT_LINE_CHARS => None,
        Channel::Text => Some(LogEntry::agent(trimmed)),
        Channel::Reasoning => Some(LogEntry::agent(format!(
            "Thinking: {}",
            take_chars(trimmed, MAX_REASONING_PREVIEW_CHARS)
        ))),
    }
}
