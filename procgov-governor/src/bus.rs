//! Event delivery to subscribers
//!
//! Every published event is traced once, then offered to each subscriber
//! in registration order without blocking the publisher.

use std::sync::{Mutex, PoisonError};

use procgov_core::GovernorEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Synchronous fan-out of [`GovernorEvent`]s
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<GovernorEvent>>>,
}

impl EventBus {
    /// Channel capacity used by [`Governor::subscribe`](crate::Governor::subscribe)
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; events published from now on are delivered
    /// to the returned receiver.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<GovernorEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Trace `event` and offer it to every subscriber.
    ///
    /// Dropped receivers are pruned. A full receiver misses this event.
    pub fn publish(&self, event: GovernorEvent) {
        event.emit_trace();

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event subscriber is full, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
