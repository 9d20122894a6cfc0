//! Per-run progress event stream.
//!
//! Each run gets one unbounded mpsc channel: the engine holds the cloneable
//! [`EventSink`], the caller drains the receiver. An unbounded channel keeps
//! `emit` non-blocking from any task; a consumer that has gone away simply
//! drops the events (same contract as a broadcast bus with no subscribers).

use pipewright_types::event::ProgressEvent;
use tokio::sync::mpsc;

/// Non-blocking sender half of a run's event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl EventSink {
    /// Create a sink and its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. Dropped silently when the consumer is gone.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
