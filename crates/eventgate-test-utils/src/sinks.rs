//! In-memory [`EventSink`] implementations for exercising the overload
//! policy without a real queue.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use eventgate_core::Event;
use eventgate_core::sink::{EventSink, PushError};

/// Accepts every event and keeps it.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.events().into_iter().map(|e| e.payload).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingSink {
    fn try_push(&self, event: Event) -> Result<(), PushError> {
        self.events.lock().expect("sink lock poisoned").push(event);
        Ok(())
    }
}

/// Always full. Counts every attempt.
#[derive(Default)]
pub struct RejectingSink {
    attempts: AtomicU32,
}

impl RejectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl EventSink for RejectingSink {
    fn try_push(&self, event: Event) -> Result<(), PushError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(PushError::Full(event))
    }
}

/// Full for the first `full_for` attempts, then records like
/// [`RecordingSink`].
pub struct FlakySink {
    full_for: u32,
    attempts: AtomicU32,
    inner: RecordingSink,
}

impl FlakySink {
    pub fn new(full_for: u32) -> Self {
        Self {
            full_for,
            attempts: AtomicU32::new(0),
            inner: RecordingSink::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.inner.payloads()
    }
}

impl EventSink for FlakySink {
    fn try_push(&self, event: Event) -> Result<(), PushError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt <= self.full_for {
            return Err(PushError::Full(event));
        }
        self.inner.try_push(event)
    }
}
