//! Output sink: the bounded queue between ingestion and analysis.
//!
//! Endpoints only ever push through [`EventSink::try_push`], which must not
//! block the reactor thread. [`push_with_retry`] implements the overload
//! policy: a bounded number of immediate retries, then the event is
//! dropped and the caller accounts for it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::event::Event;

/// Why a push was rejected. The event is handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The queue is at capacity.
    #[error("event queue is full")]
    Full(Event),
    /// The consumer side is gone.
    #[error("event queue is closed")]
    Closed(Event),
}

impl PushError {
    /// Recover the rejected event.
    pub fn into_event(self) -> Event {
        match self {
            PushError::Full(event) | PushError::Closed(event) => event,
        }
    }
}

/// A non-blocking event consumer.
///
/// Implementations are shared across endpoints and possibly across
/// threads; `try_push` must return promptly.
pub trait EventSink: Send + Sync {
    fn try_push(&self, event: Event) -> Result<(), PushError>;
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn try_push(&self, event: Event) -> Result<(), PushError> {
        (**self).try_push(event)
    }
}

/// [`EventSink`] backed by a bounded tokio mpsc channel.
#[derive(Debug, Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<Event>,
}

impl QueueSink {
    /// Total capacity of the underlying queue.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl EventSink for QueueSink {
    fn try_push(&self, event: Event) -> Result<(), PushError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => PushError::Full(event),
            mpsc::error::TrySendError::Closed(event) => PushError::Closed(event),
        })
    }
}

/// Create a bounded event queue. The receiver goes to the analysis side.
///
/// A capacity of zero is raised to one.
pub fn bounded(capacity: usize) -> (QueueSink, mpsc::Receiver<Event>) {
    if capacity == 0 {
        warn!("Event queue capacity of 0 raised to 1");
    }
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSink { tx }, rx)
}

/// Outcome of [`push_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Still full after every retry.
    DroppedFull,
    /// The consumer is gone; retrying is pointless.
    DroppedClosed,
}

/// Push `event`, retrying immediately up to `retries` times while the sink
/// reports full.
pub fn push_with_retry(sink: &dyn EventSink, event: Event, retries: u32) -> Delivery {
    let mut event = event;
    let mut attempt = 0;
    loop {
        match sink.try_push(event) {
            Ok(()) => return Delivery::Accepted,
            Err(PushError::Closed(_)) => return Delivery::DroppedClosed,
            Err(PushError::Full(rejected)) => {
                if attempt >= retries {
                    return Delivery::DroppedFull;
                }
                attempt += 1;
                event = rejected;
                std::thread::yield_now();
            }
        }
    }
}
