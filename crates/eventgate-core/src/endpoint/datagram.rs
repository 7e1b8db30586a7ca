//! Datagram endpoint. One read unit per datagram on a connectionless socket.

#[cfg(test)]
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};

use eventgate_config::{ConfigError, EndpointConfig};
use tokio::net::UnixDatagram;
use tracing::{debug, error, trace, warn};

use super::{
    Endpoint, EndpointCore, EndpointError, EndpointMonitor, FatalStreak, Intake, monitor_for,
};
use crate::event::TransportKind;
use crate::framing::{FrameSplitter, splitter_for};
use crate::reactor::{Dispatch, ReactorHandle, ReadHandler};
use crate::sink::EventSink;
use crate::socket::{SocketError, SocketPath, sys};

/// Endpoint listening on a Unix datagram socket.
pub struct DatagramEndpoint {
    core: EndpointCore,
}

impl DatagramEndpoint {
    pub fn new(config: EndpointConfig, reactor: ReactorHandle, sink: Arc<dyn EventSink>) -> Self {
        let monitor = monitor_for(&config);
        Self::with_monitor(config, reactor, sink, monitor)
    }

    /// Like [`new`](Self::new), reporting through an existing monitor.
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

impl Endpoint for DatagramEndpoint {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn monitor(&self) -> &Arc<EndpointMonitor> {
        &self.core.monitor
    }

    fn configure(&mut self) -> Result<(), EndpointError> {
        self.core.configure_with(|core| {
            let handler = DatagramHandler::open(core)?;
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
impl DatagramEndpoint {
    /// Configure with `faults` returned by the first reads.
    pub(crate) fn configure_faulty(
        &mut self,
        faults: impl IntoIterator<Item = io::Error>,
    ) -> Result<(), EndpointError> {
        let faults: VecDeque<_> = faults.into_iter().collect();
        self.core.configure_with(move |core| {
            let mut handler = DatagramHandler::open(core)?;
            handler.faults = faults;
            Ok(Box::new(handler) as Box<dyn ReadHandler>)
        })
    }
}

/// Reactor-side half: owns the socket and the path claim.
struct DatagramHandler {
    // Field order matters: the socket closes before the path is unlinked.
    socket: UnixDatagram,
    _claim: SocketPath,
    intake: Intake,
    splitter: Arc<dyn FrameSplitter>,
    /// One byte larger than `max_message_size` to detect truncation.
    buf: Vec<u8>,
    max_message_size: usize,
    read_budget: usize,
    fatal: FatalStreak,
    /// Errors returned by the next reads instead of the socket's.
    #[cfg(test)]
    faults: VecDeque<io::Error>,
}

impl DatagramHandler {
    fn open(core: &EndpointCore) -> Result<Self, EndpointError> {
        let config = &core.config;
        let path = Path::new(&config.path);
        let mode = config.mode_bits().map_err(|e| core.error_config(e))?;
        let splitter = splitter_for(config).ok_or_else(|| {
            core.error_config(ConfigError::Validation(format!(
                "framing '{}' needs a single-byte delimiter",
                config.framing
            )))
        })?;

        let claim = SocketPath::claim(path).map_err(|e| core.error_socket(e))?;
        let std_socket = claim.bind_datagram().map_err(|e| core.error_socket(e))?;

        if let Some(bytes) = config.kernel_recv_buffer {
            sys::set_recv_buffer(&std_socket, bytes).map_err(|e| {
                core.error_socket(SocketError::io("set receive buffer on", path, e))
            })?;
            if let Ok(effective) = sys::recv_buffer(&std_socket) {
                debug!(endpoint = %core.name, requested = bytes, effective, "Receive buffer set");
            }
        }

        claim.set_mode(mode).map_err(|e| core.error_socket(e))?;
        if let Some(gid) = config.gid {
            claim.set_group(gid).map_err(|e| core.error_socket(e))?;
        }

        let socket = UnixDatagram::from_std(std_socket)
            .map_err(|e| core.error_socket(SocketError::io("register", path, e)))?;

        Ok(Self {
            socket,
            _claim: claim,
            intake: core.intake(TransportKind::Datagram),
            splitter,
            buf: vec![0; config.max_message_size + 1],
            max_message_size: config.max_message_size,
            read_budget: config.read_budget.max(1),
            fatal: FatalStreak::new(config.fatal_error_threshold),
            #[cfg(test)]
            faults: VecDeque::new(),
        })
    }

    fn recv(&mut self) -> io::Result<usize> {
        #[cfg(test)]
        if let Some(e) = self.faults.pop_front() {
            return Err(e);
        }
        self.socket.try_recv(&mut self.buf)
    }

    fn handle_datagram(&mut self, n: usize) {
        let monitor = &self.intake.monitor;
        monitor.add_datagram();
        if n == 0 {
            monitor.add_empty();
            trace!(endpoint = %self.intake.endpoint(), "Empty datagram ignored");
            return;
        }

        let truncated = n > self.max_message_size;
        let len = n.min(self.max_message_size);
        let window = &self.buf[..len];
        let segments = self.splitter.split(window);
        // The cut fell inside the last segment unless it landed on a boundary.
        let last_cut = truncated && !self.splitter.ends_on_boundary(window);
        if truncated && !last_cut {
            monitor.add_truncated();
            debug!(
                endpoint = %self.intake.endpoint(),
                received = n,
                kept = len,
                "Datagram cut on a record boundary, tail dropped"
            );
        }
        if segments.is_empty() {
            monitor.add_empty();
            return;
        }

        let unit = self.intake.begin(segments.len(), None);
        let last = segments.len() - 1;
        for (i, segment) in segments.into_iter().enumerate() {
            self.intake
                .deliver(&unit, i, segment.to_vec(), last_cut && i == last);
        }
    }
}

impl ReadHandler for DatagramHandler {
    fn name(&self) -> &str {
        self.intake.endpoint()
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        // Errors surface through the read in on_readable.
        self.socket.poll_recv_ready(cx).map(|_| ())
    }

    fn on_readable(&mut self) -> Dispatch {
        for _ in 0..self.read_budget {
            match self.recv() {
                Ok(n) => {
                    self.fatal.reset();
                    self.handle_datagram(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let monitor = &self.intake.monitor;
                    monitor.add_read_error();
                    monitor.record_error(&e);
                    if sys::is_fatal(&e) && self.fatal.hit() {
                        error!(
                            endpoint = %self.intake.endpoint(),
                            error = %e,
                            "Socket unusable, failing endpoint"
                        );
                        monitor.fail(&e);
                        return Dispatch::Remove;
                    }
                    warn!(endpoint = %self.intake.endpoint(), error = %e, "Datagram read failed");
                    break;
                }
            }
        }
        Dispatch::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointState;
    use crate::event::Event;
    use crate::reactor::Reactor;
    use crate::sink::bounded;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        reactor: Reactor,
        endpoint: DatagramEndpoint,
        rx: mpsc::Receiver<Event>,
    }

    fn fixture(capacity: usize, tweak: impl FnOnce(&mut EndpointConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("q.sock");
        let mut config = EndpointConfig::datagram("q", path.to_str().unwrap());
        tweak(&mut config);
        let reactor = Reactor::new(16);
        let (sink, rx) = bounded(capacity);
        let endpoint = DatagramEndpoint::new(config, reactor.handle(), Arc::new(sink));
        Fixture {
            _dir: dir,
            reactor,
            endpoint,
            rx,
        }
    }

    fn send(path: &Path, payload: &[u8]) {
        let peer = std::os::unix::net::UnixDatagram::unbound().unwrap();
        peer.send_to(payload, path).unwrap();
    }

    async fn turn(reactor: &Reactor) -> usize {
        tokio::time::timeout(Duration::from_secs(2), reactor.turn())
            .await
            .expect("reactor turn timed out")
    }

    #[tokio::test]
    async fn test_lifecycle_binds_and_unlinks() {
        let mut f = fixture(8, |c| c.mode = "0640".to_string());
        let path = f.endpoint.path().to_path_buf();
        assert_eq!(f.endpoint.state(), EndpointState::Created);

        f.endpoint.configure().unwrap();
        assert_eq!(f.endpoint.state(), EndpointState::Configured);
        let meta = fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);

        f.endpoint.run().unwrap();
        f.endpoint.run().unwrap();
        assert_eq!(f.endpoint.state(), EndpointState::Running);

        f.endpoint.close();
        assert_eq!(f.endpoint.state(), EndpointState::Closed);
        assert!(!path.exists());
        assert!(f.reactor.is_empty());

        f.endpoint.close();
        assert_eq!(f.endpoint.state(), EndpointState::Closed);
    }

    #[tokio::test]
    async fn test_close_on_created_is_noop() {
        let mut f = fixture(8, |_| {});
        f.endpoint.close();
        assert_eq!(f.endpoint.state(), EndpointState::Created);
        assert!(!f.endpoint.path().exists());

        // Still configurable afterwards.
        f.endpoint.configure().unwrap();
        assert_eq!(f.endpoint.state(), EndpointState::Configured);
    }

    #[tokio::test]
    async fn test_configure_twice_is_rejected() {
        let mut f = fixture(8, |_| {});
        f.endpoint.configure().unwrap();
        let err = f.endpoint.configure().unwrap_err();
        assert!(matches!(
            err,
            EndpointError::InvalidState {
                op: "configure",
                state: EndpointState::Configured,
                ..
            }
        ));
        // The first socket is untouched.
        assert_eq!(f.endpoint.state(), EndpointState::Configured);
        assert!(f.endpoint.path().exists());
    }

    #[tokio::test]
    async fn test_run_before_configure_is_rejected() {
        let mut f = fixture(8, |_| {});
        assert!(matches!(
            f.endpoint.run(),
            Err(EndpointError::InvalidState { op: "run", .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_after_close() {
        let mut f = fixture(8, |_| {});
        f.endpoint.configure().unwrap();
        f.endpoint.close();
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        send(f.endpoint.path(), b"again");
        turn(&f.reactor).await;
        assert_eq!(f.rx.try_recv().unwrap().payload, b"again");
    }

    #[tokio::test]
    async fn test_one_event_per_datagram_in_order() {
        let mut f = fixture(8, |_| {});
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        for payload in [&b"one"[..], b"two", b"three"] {
            send(f.endpoint.path(), payload);
        }
        turn(&f.reactor).await;

        let mut previous = None;
        for (seq, expected) in [&b"one"[..], b"two", b"three"].into_iter().enumerate() {
            let event = f.rx.try_recv().unwrap();
            assert_eq!(event.payload, expected);
            assert_eq!(event.provenance.sequence, seq as u64);
            assert_eq!(&*event.provenance.endpoint, "q");
            assert_eq!(event.provenance.segments, 1);
            assert!(!event.provenance.truncated);
            if let Some(prev) = previous {
                assert!(event.provenance.received_at >= prev);
            }
            previous = Some(event.provenance.received_at);
        }

        let counters = f.endpoint.monitor().counters();
        assert_eq!(counters.datagrams, 3);
        assert_eq!(counters.events_accepted, 3);
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_truncated() {
        let mut f = fixture(8, |c| c.max_message_size = 1024);
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        send(f.endpoint.path(), &payload);
        turn(&f.reactor).await;

        let event = f.rx.try_recv().unwrap();
        assert_eq!(event.payload.len(), 1024);
        assert_eq!(event.payload, &payload[..1024]);
        assert!(event.provenance.truncated);
        assert_eq!(f.endpoint.monitor().counters().truncated, 1);
    }

    #[tokio::test]
    async fn test_exact_size_is_not_truncated() {
        let mut f = fixture(8, |c| c.max_message_size = 16);
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        send(f.endpoint.path(), &[7u8; 16]);
        turn(&f.reactor).await;
        let event = f.rx.try_recv().unwrap();
        assert_eq!(event.len(), 16);
        assert!(!event.provenance.truncated);
    }

    #[tokio::test]
    async fn test_delimited_datagram_yields_segments_in_order() {
        let mut f = fixture(8, |c| {
            c.framing = "delimited".to_string();
            c.delimiter = Some("\n".to_string());
        });
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        send(f.endpoint.path(), b"a\nbb\nccc");
        turn(&f.reactor).await;

        for (i, expected) in [&b"a"[..], b"bb", b"ccc"].into_iter().enumerate() {
            let event = f.rx.try_recv().unwrap();
            assert_eq!(event.payload, expected);
            assert_eq!(event.provenance.segment, i as u32);
            assert_eq!(event.provenance.segments, 3);
            assert_eq!(event.provenance.sequence, 0);
        }
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_datagram_is_counted_and_ignored() {
        let mut f = fixture(8, |_| {});
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        send(f.endpoint.path(), b"");
        send(f.endpoint.path(), b"x");
        turn(&f.reactor).await;

        assert_eq!(f.rx.try_recv().unwrap().payload, b"x");
        let counters = f.endpoint.monitor().counters();
        assert_eq!(counters.empty, 1);
        assert_eq!(counters.datagrams, 2);
        assert_eq!(counters.events_accepted, 1);
    }

    #[tokio::test]
    async fn test_full_sink_drops_and_counts_once_per_event() {
        let mut f = fixture(1, |c| c.push_retries = 2);
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        for payload in [&b"kept"[..], b"lost-1", b"lost-2"] {
            send(f.endpoint.path(), payload);
        }
        turn(&f.reactor).await;

        let counters = f.endpoint.monitor().counters();
        assert_eq!(counters.events_accepted, 1);
        assert_eq!(counters.events_dropped, 2);
        assert_eq!(f.rx.try_recv().unwrap().payload, b"kept");

        // Once drained, later datagrams flow again.
        send(f.endpoint.path(), b"after");
        turn(&f.reactor).await;
        assert_eq!(f.rx.try_recv().unwrap().payload, b"after");
    }

    #[tokio::test]
    async fn test_read_budget_bounds_one_dispatch() {
        let mut f = fixture(16, |c| c.read_budget = 2);
        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();

        for payload in [&b"1"[..], b"2", b"3"] {
            send(f.endpoint.path(), payload);
        }
        turn(&f.reactor).await;
        assert_eq!(f.endpoint.monitor().counters().datagrams, 2);

        turn(&f.reactor).await;
        assert_eq!(f.endpoint.monitor().counters().datagrams, 3);
    }

    #[tokio::test]
    async fn test_regular_file_collision_fails_endpoint() {
        let mut f = fixture(8, |_| {});
        let path = f.endpoint.path().to_path_buf();
        fs::write(&path, b"precious").unwrap();

        let err = f.endpoint.configure().unwrap_err();
        assert!(matches!(
            err,
            EndpointError::Socket {
                source: SocketError::Collision(_),
                ..
            }
        ));
        assert_eq!(f.endpoint.state(), EndpointState::Failed);
        assert!(f.endpoint.monitor().last_error().is_some());
        assert_eq!(fs::read(&path).unwrap(), b"precious");

        f.endpoint.close();
        assert_eq!(f.endpoint.state(), EndpointState::Failed);
        assert!(matches!(
            f.endpoint.configure(),
            Err(EndpointError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_socket_is_rebound() {
        let mut f = fixture(8, |_| {});
        drop(std::os::unix::net::UnixDatagram::bind(f.endpoint.path()).unwrap());

        f.endpoint.configure().unwrap();
        f.endpoint.run().unwrap();
        send(f.endpoint.path(), b"fresh");
        turn(&f.reactor).await;
        assert_eq!(f.rx.try_recv().unwrap().payload, b"fresh");
    }

    #[tokio::test]
    async fn test_bad_mode_fails_without_binding() {
        let mut f = fixture(8, |c| c.mode = "rw-rw----".to_string());
        assert!(matches!(
            f.endpoint.configure(),
            Err(EndpointError::Config { .. })
        ));
        assert_eq!(f.endpoint.state(), EndpointState::Failed);
        assert!(!f.endpoint.path().exists());
    }

    #[tokio::test]
    async fn test_kernel_recv_buffer_is_applied() {
        let mut f = fixture(8, |c| c.kernel_recv_buffer = Some(64 * 1024));
        f.endpoint.configure().unwrap();
        assert_eq!(f.endpoint.state(), EndpointState::Configured);
    }

    #[tokio::test]
    async fn test_configure_without_reactor_fails_and_cleans_up() {
        let mut f = fixture(8, |_| {});
        let path = f.endpoint.path().to_path_buf();
        drop(f.reactor);

        assert!(matches!(
            f.endpoint.configure(),
            Err(EndpointError::Reactor { .. })
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dropping_endpoint_releases_path() {
        let mut f = fixture(8, |_| {});
        let path = f.endpoint.path().to_path_buf();
        f.endpoint.configure().unwrap();
        let monitor = Arc::clone(f.endpoint.monitor());

        drop(f.endpoint);
        assert!(!path.exists());
        assert_eq!(monitor.state(), EndpointState::Closed);
    }

    fn ebadf() -> io::Error {
        io::Error::from_raw_os_error(libc::EBADF)
    }

    #[tokio::test]
    async fn test_fatal_errors_fail_and_unlink() {
        let mut f = fixture(8, |c| c.fatal_error_threshold = 3);
        f.endpoint.configure_faulty([ebadf(), ebadf(), ebadf()]).unwrap();
        f.endpoint.run().unwrap();
        let path = f.endpoint.path().to_path_buf();
        // Stays unread, so every turn reaches the failing read.
        send(&path, b"never read");

        for _ in 0..3 {
            turn(&f.reactor).await;
        }
        assert_eq!(f.endpoint.state(), EndpointState::Failed);
        assert!(!path.exists());
        assert!(f.reactor.is_empty());
        assert_eq!(f.endpoint.monitor().counters().read_errors, 3);
        assert!(f.endpoint.monitor().last_error().is_some());

        f.endpoint.close();
        assert_eq!(f.endpoint.state(), EndpointState::Failed);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fatal_streak_below_threshold_recovers() {
        let mut f = fixture(8, |c| c.fatal_error_threshold = 3);
        f.endpoint.configure_faulty([ebadf(), ebadf()]).unwrap();
        f.endpoint.run().unwrap();
        send(f.endpoint.path(), b"survivor");

        for _ in 0..3 {
            turn(&f.reactor).await;
        }
        assert_eq!(f.rx.try_recv().unwrap().payload, b"survivor");
        assert_eq!(f.endpoint.state(), EndpointState::Running);
        assert_eq!(f.endpoint.monitor().counters().read_errors, 2);
    }
}
