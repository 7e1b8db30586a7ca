#![deny(unsafe_code)]

//! eventgate core runtime.
//!
//! The local ingestion front door of a host-based security monitoring
//! agent: endpoints listen on Unix sockets, a single-threaded reactor
//! drives their reads, and every received payload becomes an [`Event`]
//! pushed into a bounded queue for the analysis pipeline.

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Daemon runtime: reactor thread, event queue, control plane.
pub mod daemon;
/// Endpoint lifecycle contract and transport variants.
pub mod endpoint;
/// Events and their provenance.
pub mod event;
/// Record framing within datagrams and streams.
pub mod framing;
/// Control-plane API over a Unix socket.
pub mod ipc;
/// Single-threaded cooperative reactor.
pub mod reactor;
/// Output sink and the overload policy.
pub mod sink;
/// Socket path ownership and raw socket options.
pub mod socket;

pub use daemon::{Daemon, DaemonError, ShutdownSignal};
pub use endpoint::{
    DatagramEndpoint, Endpoint, EndpointError, EndpointMonitor, EndpointState, EndpointStatus,
    StreamEndpoint,
};
pub use event::{Event, Provenance, TransportKind};
pub use reactor::{Reactor, ReactorHandle};
pub use sink::{EventSink, PushError, QueueSink};
