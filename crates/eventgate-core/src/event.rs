//! Events in flight between an endpoint and the event queue.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The local transport an endpoint listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Connectionless Unix datagram socket.
    Datagram,
    /// Connection-oriented Unix stream socket.
    Stream,
}

impl TransportKind {
    /// Map a validated config string to a transport kind.
    pub fn from_config(s: &str) -> Option<Self> {
        match s {
            "datagram" => Some(Self::Datagram),
            "stream" => Some(Self::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Datagram => write!(f, "datagram"),
            TransportKind::Stream => write!(f, "stream"),
        }
    }
}

/// Where and when an event was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Name of the endpoint that received the event.
    pub endpoint: Arc<str>,
    /// Transport of that endpoint.
    pub transport: TransportKind,
    /// Arrival time. Never decreases across events of one endpoint.
    pub received_at: SystemTime,
    /// Position of the read unit (datagram or stream record) on its endpoint.
    pub sequence: u64,
    /// Index of this event within its read unit.
    pub segment: u32,
    /// Number of events the read unit was split into.
    pub segments: u32,
    /// This payload was cut at `max_message_size`. A segment that arrived
    /// whole is never flagged, even when later segments of the same
    /// datagram were lost to the cut.
    pub truncated: bool,
    /// Connection the record arrived on (stream endpoints only).
    pub connection: Option<u64>,
}

/// An opaque payload plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub payload: Vec<u8>,
    pub provenance: Provenance,
}

impl Event {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Per-endpoint arrival clock.
///
/// Wall-clock time can step backwards (NTP, manual changes); stamps handed
/// out by one clock are clamped so they never do.
#[derive(Debug)]
pub struct ArrivalClock {
    last: SystemTime,
}

impl ArrivalClock {
    pub fn new() -> Self {
        Self {
            last: SystemTime::UNIX_EPOCH,
        }
    }

    /// Current time, or the previous stamp if the clock went backwards.
    pub fn stamp(&mut self) -> SystemTime {
        self.observe(SystemTime::now())
    }

    fn observe(&mut self, now: SystemTime) -> SystemTime {
        if now > self.last {
            self.last = now;
        }
        self.last
    }
}

impl Default for ArrivalClock {
    fn default() -> Self {
        Self::new()
    }
}
