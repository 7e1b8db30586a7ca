//! Stream endpoint: Unix stream listener with delimiter-framed records.
//!
//! Streams carry no message boundaries, so every connection feeds a
//! [`RecordAssembler`]. Each complete record is its own read unit. The
//! listener and all connections are serviced by one read handler; a
//! misbehaving connection only ever closes itself.

#[cfg(test)]
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};

use eventgate_config::{ConfigError, EndpointConfig};
use tokio::net::unix::SocketAddr;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, warn};

use super::{
    Endpoint, EndpointCore, EndpointError, EndpointMonitor, FatalStreak, Intake, monitor_for,
};
use crate::event::TransportKind;
use crate::framing::{Record, RecordAssembler};
use crate::reactor::{Dispatch, ReactorHandle, ReadHandler};
use crate::sink::EventSink;
use crate::socket::{SocketError, SocketPath, sys};

/// Bytes read from a connection per `try_read`.
const READ_CHUNK: usize = 16 * 1024;

/// Endpoint listening on a Unix stream socket.
pub struct StreamEndpoint {
    core: EndpointCore,
}

impl StreamEndpoint {
    pub fn new(config: EndpointConfig, reactor: ReactorHandle, sink: Arc<dyn EventSink>) -> Self {
        let monitor = monitor_for(&config);
        Self::with_monitor(config, reactor, sink, monitor)
    }

    pub fn with_monitor(
        config: EndpointConfig,
        reactor: ReactorHandle,
        sink: Arc<dyn EventSink>,
        monitor: Arc<EndpointMonitor>,
    ) -> Self {
        Self {
            core: EndpointCore::new(config, reactor, sink, monitor),
        }
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.core.config.path)
    }
}

impl Endpoint for StreamEndpoint {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn monitor(&self) -> &Arc<EndpointMonitor> {
        &self.core.monitor
    }

    fn configure(&mut self) -> Result<(), EndpointError> {
        self.core.configure_with(|core| {
            let handler = StreamHandler::open(core)?;
            Ok(Box::new(handler) as Box<dyn ReadHandler>)
        })
    }

    fn run(&mut self) -> Result<(), EndpointError> {
        self.core.run()
    }

    fn close(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
impl StreamEndpoint {
    /// Configure with `faults` returned by the first accepts.
    pub(crate) fn configure_faulty(
        &mut self,
        faults: impl IntoIterator<Item = io::Error>,
    ) -> Result<(), EndpointError> {
        let faults: VecDeque<_> = faults.into_iter().collect();
        self.core.configure_with(move |core| {
            let mut handler = StreamHandler::open(core)?;
            handler.faults = faults;
            Ok(Box::new(handler) as Box<dyn ReadHandler>)
        })
    }
}

struct Connection {
    id: u64,
    stream: UnixStream,
    assembler: RecordAssembler,
    ready: bool,
}

struct StreamHandler {
    // Connections and listener close before the path is unlinked.
    connections: Vec<Connection>,
    listener: UnixListener,
    _claim: SocketPath,
    intake: Intake,
    buf: Vec<u8>,
    delimiter: u8,
    max_message_size: usize,
    max_connections: usize,
    read_budget: usize,
    next_connection: u64,
    fatal: FatalStreak,
    failure: Option<io::Error>,
    /// Errors returned by the next accepts instead of the listener's.
    #[cfg(test)]
    faults: VecDeque<io::Error>,
}

impl StreamHandler {
    fn open(core: &EndpointCore) -> Result<Self, EndpointError> {
        let config = &core.config;
        let path = Path::new(&config.path);
        let mode = config.mode_bits().map_err(|e| core.error_config(e))?;
        let delimiter = config
            .delimiter_byte()
            .map_err(|e| core.error_config(e))?
            .ok_or_else(|| {
                core.error_config(ConfigError::Validation(
                    "stream endpoints need a single-byte delimiter".to_string(),
                ))
            })?;

        let claim = SocketPath::claim(path).map_err(|e| core.error_socket(e))?;
        let std_listener = claim.bind_listener().map_err(|e| core.error_socket(e))?;
        claim.set_mode(mode).map_err(|e| core.error_socket(e))?;
        if let Some(gid) = config.gid {
            claim.set_group(gid).map_err(|e| core.error_socket(e))?;
        }
        let listener = UnixListener::from_std(std_listener)
            .map_err(|e| core.error_socket(SocketError::io("register", path, e)))?;

        Ok(Self {
            connections: Vec::new(),
            listener,
            _claim: claim,
            intake: core.intake(TransportKind::Stream),
            buf: vec![0; READ_CHUNK],
            delimiter,
            max_message_size: config.max_message_size,
            max_connections: config.max_connections,
            read_budget: config.read_budget.max(1),
            next_connection: 0,
            fatal: FatalStreak::new(config.fatal_error_threshold),
            failure: None,
            #[cfg(test)]
            faults: VecDeque::new(),
        })
    }

    fn accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(UnixStream, SocketAddr)>> {
        #[cfg(test)]
        if let Some(e) = self.faults.pop_front() {
            return Poll::Ready(Err(e));
        }
        self.listener.poll_accept(cx)
    }

    /// Accept pending connections, refusing those over the cap.
    ///
    /// Returns true when the listener must be polled again on the next
    /// turn: the budget ran out before the backlog did, or an accept
    /// failed. Neither case registers a waker for the listener.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> bool {
        for _ in 0..self.read_budget {
            match self.accept(cx) {
                Poll::Pending => return false,
                Poll::Ready(Ok((stream, _))) => {
                    self.fatal.reset();
                    self.admit(stream);
                }
                Poll::Ready(Err(e)) => {
                    let monitor = &self.intake.monitor;
                    monitor.add_read_error();
                    monitor.record_error(&e);
                    if sys::is_fatal(&e) && self.fatal.hit() {
                        self.failure = Some(e);
                    } else {
                        warn!(endpoint = %self.intake.endpoint(), error = %e, "Accept failed");
                    }
                    return true;
                }
            }
        }
        debug!(
            endpoint = %self.intake.endpoint(),
            budget = self.read_budget,
            "Accept budget spent, backlog left for the next turn"
        );
        true
    }

    fn admit(&mut self, stream: UnixStream) {
        let monitor = &self.intake.monitor;
        if self.connections.len() >= self.max_connections {
            monitor.add_connection_refused();
            warn!(
                endpoint = %self.intake.endpoint(),
                max_connections = self.max_connections,
                "Connection limit reached, closing new connection"
            );
            return;
        }
        monitor.add_connection();
        let id = self.next_connection;
        self.next_connection += 1;
        debug!(endpoint = %self.intake.endpoint(), connection = id, "Connection accepted");
        self.connections.push(Connection {
            id,
            stream,
            assembler: RecordAssembler::new(self.delimiter, self.max_message_size),
            ready: false,
        });
    }
}

fn emit(intake: &mut Intake, connection: u64, record: Record) {
    intake.monitor.add_datagram();
    let unit = intake.begin(1, Some(connection));
    intake.deliver(&unit, 0, record.payload, record.truncated);
}

/// Read what a connection has. Returns false once it should be closed.
fn drain(conn: &mut Connection, intake: &mut Intake, buf: &mut [u8], budget: usize) -> bool {
    let mut records = Vec::new();
    for _ in 0..budget {
        match conn.stream.try_read(buf) {
            Ok(0) => {
                if let Some(tail) = conn.assembler.finish() {
                    emit(intake, conn.id, tail);
                }
                debug!(
                    endpoint = %intake.endpoint(),
                    connection = conn.id,
                    "Connection closed by peer"
                );
                return false;
            }
            Ok(n) => {
                conn.assembler.push(&buf[..n], &mut records);
                for record in records.drain(..) {
                    emit(intake, conn.id, record);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                intake.monitor.add_read_error();
                intake.monitor.record_error(&e);
                warn!(
                    endpoint = %intake.endpoint(),
                    connection = conn.id,
                    error = %e,
                    "Connection read failed, closing it"
                );
                return false;
            }
        }
    }
    true
}

impl ReadHandler for StreamHandler {
    fn name(&self) -> &str {
        self.intake.endpoint()
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let backlog = self.poll_accept(cx);
        if self.failure.is_some() {
            return Poll::Ready(());
        }

        let mut any = backlog;
        for conn in &mut self.connections {
            if conn.stream.poll_read_ready(cx).is_ready() {
                conn.ready = true;
                any = true;
            }
        }
        if any { Poll::Ready(()) } else { Poll::Pending }
    }

    fn on_readable(&mut self) -> Dispatch {
        if let Some(e) = self.failure.take() {
            error!(
                endpoint = %self.intake.endpoint(),
                error = %e,
                "Listener unusable, failing endpoint"
            );
            self.intake.monitor.fail(&e);
            return Dispatch::Remove;
        }

        let budget = self.read_budget;
        let intake = &mut self.intake;
        let buf = &mut self.buf;
        self.connections.retain_mut(|conn| {
            if !std::mem::take(&mut conn.ready) {
                return true;
            }
            drain(conn, intake, buf, budget)
        });
        Dispatch::Continue
    }
}
