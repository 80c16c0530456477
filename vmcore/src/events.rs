//! Event bus (Design Notes §9: "re-architect as a subscription interface
//! with a non-blocking publish").
//!
//! The canonical state is always the record set in [`crate::store::Store`],
//! never this stream — a subscriber that falls behind simply drops events,
//! it never blocks a lifecycle operation.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    Created { vm_id: String },
    Booting { vm_id: String },
    Started { vm_id: String },
    Stopped { vm_id: String },
    Paused { vm_id: String },
    Resumed { vm_id: String },
    Deleted { vm_id: String },
    Error { vm_id: String, message: String },
    Warmup { base_image: String, phase: String },
}

/// Best-effort, non-blocking publish/subscribe over [`Event`]s.
///
/// Backed by a bounded broadcast channel: a slow subscriber lags and misses
/// events rather than applying backpressure to the publisher, matching the
/// "subscribers that cannot keep up drop events" requirement.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish is deliberately infallible from the caller's perspective: no
    /// subscribers, or a lagging subscriber, is not an error for the
    /// publisher.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
