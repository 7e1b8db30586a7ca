#![deny(unsafe_code)]

//! Shared test utilities for the eventgate workspace.
//!
//! Provides reusable fixtures, config builders, sinks, and tracing helpers
//! so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! eventgate-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod sinks;
pub mod sockets;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::TestDaemon;
pub use sinks::{FlakySink, RecordingSink, RejectingSink};
pub use sockets::{SocketDir, send_datagram};
