//! Cross-thread view of an endpoint: lifecycle state and counters.
//!
//! The endpoint and its read handler live on the reactor thread; the
//! monitor is the only part shared with the owner and the control plane.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::event::TransportKind;

/// Endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Created,
    Configured,
    Running,
    Closing,
    Closed,
    Failed,
}

impl EndpointState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Configured,
            2 => Self::Running,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Configured => 1,
            Self::Running => 2,
            Self::Closing => 3,
            Self::Closed => 4,
            Self::Failed => 5,
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Read units received (datagrams, or records on stream connections).
    pub datagrams: u64,
    pub events_accepted: u64,
    /// Events dropped because the sink stayed full or was closed.
    pub events_dropped: u64,
    /// Read units cut at `max_message_size`.
    pub truncated: u64,
    /// Empty read units, ignored.
    pub empty: u64,
    pub read_errors: u64,
    /// Stream connections accepted (stream endpoints only).
    pub connections: u64,
    /// Stream connections refused at the `max_connections` cap.
    pub connections_refused: u64,
}

/// Serializable snapshot for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub transport: TransportKind,
    pub path: PathBuf,
    pub state: EndpointState,
    pub counters: Counters,
    pub last_error: Option<String>,
}

/// Shared state and counters of one endpoint.
#[derive(Debug)]
pub struct EndpointMonitor {
    name: String,
    transport: TransportKind,
    path: PathBuf,
    state: AtomicU8,
    datagrams: AtomicU64,
    events_accepted: AtomicU64,
    events_dropped: AtomicU64,
    truncated: AtomicU64,
    empty: AtomicU64,
    read_errors: AtomicU64,
    connections: AtomicU64,
    connections_refused: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl EndpointMonitor {
    pub fn new(name: &str, transport: TransportKind, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            transport,
            path: path.to_path_buf(),
            state: AtomicU8::new(EndpointState::Created.as_u8()),
            datagrams: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            empty: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EndpointState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Record a failure and move to `Failed`.
    pub(crate) fn fail(&self, error: impl fmt::Display) {
        self.record_error(error);
        self.set_state(EndpointState::Failed);
    }

    pub(crate) fn record_error(&self, error: impl fmt::Display) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }

    pub(crate) fn add_datagram(&self) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of drops including this one.
    pub(crate) fn add_dropped(&self) -> u64 {
        self.events_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            name: self.name.clone(),
            transport: self.transport,
            path: self.path.clone(),
            state: self.state(),
            counters: self.counters(),
            last_error: self.last_error(),
        }
    }
}
