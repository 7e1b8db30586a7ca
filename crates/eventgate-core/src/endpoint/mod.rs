//! Endpoints: transport-specific listeners sharing one lifecycle.
//!
//! ```text
//!   Created ──configure──▶ Configured ──run──▶ Running
//!                     ▲        │                 │
//!                     │        └──▶ Closing ◀────┘ close
//!                 configure           │
//!                     └──── Closed ◀──┘       any ──fatal──▶ Failed
//! ```
//!
//! Every endpoint holds a weak [`ReactorHandle`] and, while configured, a
//! [`Registration`] whose handler owns the socket and its [`SocketPath`]
//! claim. Releasing the registration therefore closes the socket and
//! unlinks the path in one step, whether it happens in `close()`, on drop,
//! or because the handler removed itself after a fatal error.
//!
//! Endpoints are bound to the reactor thread. `configure()` must run inside
//! the tokio runtime that drives the reactor.
//!
//! [`SocketPath`]: crate::socket::SocketPath

pub mod datagram;
pub mod monitor;
pub mod stream;

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use eventgate_config::{ConfigError, EndpointConfig};
use tracing::{debug, error, info, warn};

use crate::event::{ArrivalClock, Event, Provenance, TransportKind};
use crate::reactor::{ReactorError, ReactorHandle, ReadHandler, Registration};
use crate::sink::{Delivery, EventSink, push_with_retry};
use crate::socket::SocketError;

pub use datagram::DatagramEndpoint;
pub use monitor::{Counters, EndpointMonitor, EndpointState, EndpointStatus};
pub use stream::StreamEndpoint;

/// Drops are logged at `warn` on the first and then every this many.
const DROP_WARN_INTERVAL: u64 = 1024;

/// The lifecycle contract shared by all transports.
pub trait Endpoint {
    fn name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Shared state and counters, also visible to other threads.
    fn monitor(&self) -> &Arc<EndpointMonitor>;

    fn state(&self) -> EndpointState {
        self.monitor().state()
    }

    /// Bind the socket and register its read handler with the reactor.
    ///
    /// Valid from `Created` or `Closed`. On error the endpoint is `Failed`
    /// and holds no socket or path.
    fn configure(&mut self) -> Result<(), EndpointError>;

    /// Start servicing the socket. Never blocks. Idempotent while running.
    fn run(&mut self) -> Result<(), EndpointError>;

    /// Release the socket, the path, and the registration.
    ///
    /// Valid in any state; repeated calls are no-ops, and so is closing an
    /// endpoint that was never configured. A `Failed` endpoint releases its
    /// resources but stays `Failed`.
    fn close(&mut self);
}

/// Errors reported by endpoint lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint '{endpoint}': cannot {op} while {state}")]
    InvalidState {
        endpoint: String,
        op: &'static str,
        state: EndpointState,
    },

    #[error("endpoint '{endpoint}': {source}")]
    Config {
        endpoint: String,
        #[source]
        source: ConfigError,
    },

    #[error("endpoint '{endpoint}': {source}")]
    Socket {
        endpoint: String,
        #[source]
        source: SocketError,
    },

    #[error("endpoint '{endpoint}': {source}")]
    Reactor {
        endpoint: String,
        #[source]
        source: ReactorError,
    },
}

/// Build the endpoint variant a config entry asks for.
pub fn build_endpoint(
    config: EndpointConfig,
    reactor: ReactorHandle,
    sink: Arc<dyn EventSink>,
    monitor: Arc<EndpointMonitor>,
) -> Result<Box<dyn Endpoint>, EndpointError> {
    match TransportKind::from_config(&config.transport) {
        Some(TransportKind::Datagram) => Ok(Box::new(DatagramEndpoint::with_monitor(
            config, reactor, sink, monitor,
        ))),
        Some(TransportKind::Stream) => Ok(Box::new(StreamEndpoint::with_monitor(
            config, reactor, sink, monitor,
        ))),
        None => Err(EndpointError::Config {
            endpoint: config.name.clone(),
            source: ConfigError::Validation(format!(
                "unknown transport '{}'",
                config.transport
            )),
        }),
    }
}

/// Monitor for a config entry, before the endpoint itself exists.
pub fn monitor_for(config: &EndpointConfig) -> Arc<EndpointMonitor> {
    let transport =
        TransportKind::from_config(&config.transport).unwrap_or(TransportKind::Datagram);
    Arc::new(EndpointMonitor::new(
        &config.name,
        transport,
        Path::new(&config.path),
    ))
}

/// Lifecycle bookkeeping common to every endpoint variant.
pub(crate) struct EndpointCore {
    pub(crate) config: EndpointConfig,
    pub(crate) name: Arc<str>,
    pub(crate) monitor: Arc<EndpointMonitor>,
    pub(crate) sink: Arc<dyn EventSink>,
    reactor: ReactorHandle,
    registration: Option<Registration>,
}

impl EndpointCore {
    pub(crate) fn new(
        config: EndpointConfig,
        reactor: ReactorHandle,
        sink: Arc<dyn EventSink>,
        monitor: Arc<EndpointMonitor>,
    ) -> Self {
        Self {
            name: Arc::from(config.name.as_str()),
            config,
            monitor,
            sink,
            reactor,
            registration: None,
        }
    }

    pub(crate) fn error_config(&self, source: ConfigError) -> EndpointError {
        EndpointError::Config {
            endpoint: self.config.name.clone(),
            source,
        }
    }

    pub(crate) fn error_socket(&self, source: SocketError) -> EndpointError {
        EndpointError::Socket {
            endpoint: self.config.name.clone(),
            source,
        }
    }

    fn invalid(&self, op: &'static str, state: EndpointState) -> EndpointError {
        EndpointError::InvalidState {
            endpoint: self.config.name.clone(),
            op,
            state,
        }
    }

    /// Shared per-event delivery state for a new read handler.
    pub(crate) fn intake(&self, transport: TransportKind) -> Intake {
        Intake {
            endpoint: Arc::clone(&self.name),
            transport,
            monitor: Arc::clone(&self.monitor),
            sink: Arc::clone(&self.sink),
            push_retries: self.config.push_retries,
            clock: ArrivalClock::new(),
            sequence: 0,
        }
    }

    /// Run `open` to build the read handler and register it.
    pub(crate) fn configure_with<F>(&mut self, open: F) -> Result<(), EndpointError>
    where
        F: FnOnce(&Self) -> Result<Box<dyn ReadHandler>, EndpointError>,
    {
        let state = self.monitor.state();
        if !matches!(state, EndpointState::Created | EndpointState::Closed) {
            return Err(self.invalid("configure", state));
        }

        let registered = open(self).and_then(|handler| {
            let reactor = self.reactor.upgrade().map_err(|source| EndpointError::Reactor {
                endpoint: self.config.name.clone(),
                source,
            })?;
            Ok(reactor.register(handler))
        });

        match registered {
            Ok(registration) => {
                self.registration = Some(registration);
                self.monitor.set_state(EndpointState::Configured);
                info!(
                    endpoint = %self.name,
                    path = %self.config.path,
                    transport = %self.config.transport,
                    "Endpoint configured"
                );
                Ok(())
            }
            Err(e) => {
                error!(endpoint = %self.name, error = %e, "Endpoint configuration failed");
                self.monitor.fail(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn run(&mut self) -> Result<(), EndpointError> {
        match self.monitor.state() {
            EndpointState::Running => Ok(()),
            EndpointState::Configured => {
                let Some(registration) = self.registration.as_ref() else {
                    return Err(self.invalid("run", EndpointState::Configured));
                };
                registration.arm().map_err(|source| EndpointError::Reactor {
                    endpoint: self.config.name.clone(),
                    source,
                })?;
                self.monitor.set_state(EndpointState::Running);
                info!(endpoint = %self.name, "Endpoint running");
                Ok(())
            }
            state => Err(self.invalid("run", state)),
        }
    }

    pub(crate) fn close(&mut self) {
        match self.monitor.state() {
            EndpointState::Created | EndpointState::Closed => {}
            EndpointState::Failed => {
                if self.registration.take().is_some() {
                    debug!(endpoint = %self.name, "Released failed endpoint");
                }
            }
            EndpointState::Configured | EndpointState::Running | EndpointState::Closing => {
                self.monitor.set_state(EndpointState::Closing);
                // Deregistering drops the handler: socket first, then path.
                drop(self.registration.take());
                self.monitor.set_state(EndpointState::Closed);
                info!(endpoint = %self.name, "Endpoint closed");
            }
        }
    }
}

impl Drop for EndpointCore {
    fn drop(&mut self) {
        if self.registration.is_some() {
            self.close();
        }
    }
}

/// Tracks consecutive fatal socket errors against a threshold.
#[derive(Debug)]
pub(crate) struct FatalStreak {
    consecutive: u32,
    threshold: u32,
}

impl FatalStreak {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count one fatal error; true once the threshold is reached.
    pub(crate) fn hit(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.threshold
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Provenance shared by every event split from one read unit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadUnit {
    sequence: u64,
    received_at: SystemTime,
    segments: u32,
    connection: Option<u64>,
}

/// Turns payloads into events and pushes them under the overload policy.
pub(crate) struct Intake {
    endpoint: Arc<str>,
    transport: TransportKind,
    pub(crate) monitor: Arc<EndpointMonitor>,
    sink: Arc<dyn EventSink>,
    push_retries: u32,
    clock: ArrivalClock,
    sequence: u64,
}

impl Intake {
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stamp a new read unit that will yield `segments` events.
    pub(crate) fn begin(&mut self, segments: usize, connection: Option<u64>) -> ReadUnit {
        let sequence = self.sequence;
        self.sequence += 1;
        ReadUnit {
            sequence,
            received_at: self.clock.stamp(),
            segments: u32::try_from(segments).unwrap_or(u32::MAX),
            connection,
        }
    }

    /// Push one event. Returns whether the sink accepted it.
    pub(crate) fn deliver(
        &mut self,
        unit: &ReadUnit,
        segment: usize,
        payload: Vec<u8>,
        truncated: bool,
    ) -> bool {
        if truncated {
            self.monitor.add_truncated();
        }
        let event = Event {
            payload,
            provenance: Provenance {
                endpoint: Arc::clone(&self.endpoint),
                transport: self.transport,
                received_at: unit.received_at,
                sequence: unit.sequence,
                segment: u32::try_from(segment).unwrap_or(u32::MAX),
                segments: unit.segments,
                truncated,
                connection: unit.connection,
            },
        };

        let delivery = push_with_retry(&*self.sink, event, self.push_retries);
        if delivery == Delivery::Accepted {
            self.monitor.add_accepted();
            return true;
        }

        let dropped = self.monitor.add_dropped();
        debug!(
            endpoint = %self.endpoint,
            sequence = unit.sequence,
            segment,
            ?delivery,
            "Event dropped"
        );
        if dropped == 1 || dropped % DROP_WARN_INTERVAL == 0 {
            warn!(
                endpoint = %self.endpoint,
                dropped,
                ?delivery,
                "Event sink overloaded, dropping events"
            );
        }
        false
    }
}
