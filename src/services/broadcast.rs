//! Progress Broadcast
//!
//! Fire-and-forget sink for board events. The transport that carries them to
//! clients (SSE, websockets) subscribes to [`BroadcastHub`].

use board_runner_core::BoardEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Where the orchestrator publishes lifecycle, progress and log events.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: BoardEvent);
}

/// Default channel capacity; slow subscribers lag instead of blocking.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 512;

/// `tokio::broadcast` fan-out of board events
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<BoardEvent>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl ProgressSink for BroadcastHub {
    fn publish(&self, event: BoardEvent) {
        trace!(event = event.name(), "publish");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}
