//! Progress Reporting
//!
//! Coarse-grained phase notifications emitted once per iteration, before the
//! executor is invoked. Publishing is fire-and-forget: a slow or absent
//! observer never blocks or fails a batch.

use tokio::sync::broadcast;
use tracing::info;

use super::types::BatchRequestId;

/// Observable orchestration phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// About to issue and pay one iteration
    Paying,
}

impl Phase {
    /// Human-readable label shown to observers
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Paying => "Paying recipient",
        }
    }
}

/// Sink for phase notifications
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, request_id: BatchRequestId, phase: Phase);
}

/// Discards all notifications
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressPublisher for NoopProgress {
    fn publish(&self, _request_id: BatchRequestId, _phase: Phase) {}
}

/// Emits each notification as a tracing event under the `progress` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressPublisher for TracingProgress {
    fn publish(&self, request_id: BatchRequestId, phase: Phase) {
        info!(target: "progress", request_id = %request_id, phase = phase.label(), "Batch progress");
    }
}

/// One published notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub request_id: BatchRequestId,
    pub phase: Phase,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// Fans notifications out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastProgress {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ProgressPublisher for BroadcastProgress {
    fn publish(&self, request_id: BatchRequestId, phase: Phase) {
        // No subscribers is fine
        let _ = self.sender.send(ProgressEvent {
            request_id,
            phase,
            published_at: chrono::Utc::now(),
        });
    }
}
