//! Core daemon process: startup, shutdown, and the ingestion loop.
//!
//! ```text
//!   main runtime                         eventgate-reactor thread
//!   ────────────                         ────────────────────────
//!   Daemon::run ──spawn──────────────▶   current-thread runtime
//!     │                                    build endpoints, configure, run
//!     │ ◀──────── startup report ───────   (oneshot)
//!     │ IPC server (axum)                  loop { reactor.turn() }
//!     │ ctrl-c / IPC /stop ──broadcast──▶  close every endpoint
//!     │ ◀──────── exit report ──────────   (oneshot)
//! ```
//!
//! Endpoints and the reactor never leave their thread. The bounded event
//! queue and the endpoint monitors are the only state shared with the rest
//! of the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use eventgate_config::AppConfig;

use crate::endpoint::{
    Endpoint, EndpointMonitor, EndpointState, EndpointStatus, build_endpoint, monitor_for,
};
use crate::event::Event;
use crate::ipc::server::{self, IpcState};
use crate::reactor::Reactor;
use crate::sink::{EventSink, QueueSink, bounded};

/// Name of the thread that owns the reactor and every endpoint.
pub const REACTOR_THREAD_NAME: &str = "eventgate-reactor";

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The eventgate daemon: ingestion endpoints, event queue, control plane.
pub struct Daemon {
    config: AppConfig,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    _shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    queue: QueueSink,
    events: Option<mpsc::Receiver<Event>>,
    monitors: Vec<Arc<EndpointMonitor>>,
}

impl Daemon {
    /// Create a new daemon instance with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        let (queue, events) = bounded(config.daemon.queue_capacity);
        let monitors = config.endpoints.iter().map(monitor_for).collect();

        Self {
            config,
            shutdown_tx,
            _shutdown_rx,
            queue,
            events: Some(events),
            monitors,
        }
    }

    /// Hand the event receiver to the downstream consumer. Only the first
    /// call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }

    /// Monitors of all configured endpoints, in config order.
    pub fn monitors(&self) -> &[Arc<EndpointMonitor>] {
        &self.monitors
    }

    pub fn statuses(&self) -> Vec<EndpointStatus> {
        self.monitors.iter().map(|m| m.status()).collect()
    }

    /// Run the daemon until shutdown is requested or every endpoint failed.
    pub async fn run(&self) -> Result<(), DaemonError> {
        if self.config.endpoints.is_empty() {
            return Err(DaemonError::Startup("no endpoints configured".to_string()));
        }
        info!(
            endpoints = self.config.endpoints.len(),
            queue_capacity = self.config.daemon.queue_capacity,
            "eventgate daemon starting"
        );

        let started_at = Instant::now();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = oneshot::channel();
        let ingest = Ingest {
            config: self.config.clone(),
            queue: self.queue.clone(),
            monitors: self.monitors.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let reactor_thread = thread::Builder::new()
            .name(REACTOR_THREAD_NAME.to_string())
            .spawn(move || ingest.run_on_thread(ready_tx, exit_tx))?;

        let live = match ready_rx.await {
            Ok(Ok(live)) => live,
            Ok(Err(e)) => {
                let _ = reactor_thread.join();
                return Err(e);
            }
            Err(_) => return Err(DaemonError::ReactorExited),
        };
        info!(live, total = self.monitors.len(), "Endpoints running");

        let ipc = self.spawn_ipc(started_at);

        let outcome = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping daemon");
                None
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                None
            }
            exited = &mut exit_rx => Some(exited),
        };

        // Stops the IPC server and, if still running, the reactor thread.
        let _ = self.shutdown_tx.send(ShutdownSignal);

        let result = match outcome {
            Some(exited) => exited.unwrap_or(Err(DaemonError::ReactorExited)),
            None => exit_rx.await.unwrap_or(Err(DaemonError::ReactorExited)),
        };
        let _ = reactor_thread.join();

        if let Some(ipc) = ipc {
            match ipc.await {
                Ok(Err(e)) => warn!(error = %e, "IPC server ended with an error"),
                Err(e) => warn!(error = %e, "IPC server task failed"),
                Ok(Ok(())) => {}
            }
        }

        info!("Daemon stopped");
        result
    }

    fn spawn_ipc(
        &self,
        started_at: Instant,
    ) -> Option<tokio::task::JoinHandle<Result<(), server::IpcServerError>>> {
        if !self.config.control.enabled {
            return None;
        }
        let socket_path = PathBuf::from(&self.config.control.socket_path);
        let state = Arc::new(IpcState {
            config: self.config.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            monitors: self.monitors.clone(),
            queue: self.queue.clone(),
            started_at,
        });
        let shutdown_rx = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let result = server::serve(&socket_path, state, shutdown_rx).await;
            if let Err(e) = &result {
                error!(path = %socket_path.display(), error = %e, "IPC server failed");
            }
            result
        }))
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// A sender that can request shutdown from another task.
    pub fn shutdown_sender(&self) -> broadcast::Sender<ShutdownSignal> {
        self.shutdown_tx.clone()
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// Everything the reactor thread takes with it.
struct Ingest {
    config: AppConfig,
    queue: QueueSink,
    monitors: Vec<Arc<EndpointMonitor>>,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

impl Ingest {
    fn run_on_thread(
        self,
        ready_tx: oneshot::Sender<Result<usize, DaemonError>>,
        exit_tx: oneshot::Sender<Result<(), DaemonError>>,
    ) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready_tx.send(Err(DaemonError::Io(e)));
                return;
            }
        };
        let result = runtime.block_on(self.run(ready_tx));
        let _ = exit_tx.send(result);
    }

    async fn run(
        mut self,
        ready_tx: oneshot::Sender<Result<usize, DaemonError>>,
    ) -> Result<(), DaemonError> {
        let reactor = Reactor::new(self.config.daemon.max_dispatch_per_turn);
        let sink: Arc<dyn EventSink> = Arc::new(self.queue.clone());
        let total = self.config.endpoints.len();

        let mut endpoints: Vec<Box<dyn Endpoint>> = Vec::with_capacity(total);
        for (config, monitor) in self.config.endpoints.iter().cloned().zip(&self.monitors) {
            let name = config.name.clone();
            let built = build_endpoint(
                config,
                reactor.handle(),
                Arc::clone(&sink),
                Arc::clone(monitor),
            );
            let mut endpoint = match built {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    error!(endpoint = %name, error = %e, "Endpoint could not be built");
                    monitor.fail(&e);
                    continue;
                }
            };
            // Errors are logged and recorded on the monitor by the endpoint.
            if endpoint.configure().is_ok() {
                if let Err(e) = endpoint.run() {
                    error!(endpoint = %name, error = %e, "Endpoint could not start");
                }
            }
            endpoints.push(endpoint);
        }

        let live = endpoints
            .iter()
            .filter(|e| e.state() == EndpointState::Running)
            .count();
        if live == 0 {
            error!(total, "Every endpoint failed to start");
            let _ = ready_tx.send(Err(DaemonError::AllEndpointsFailed { total }));
            return Err(DaemonError::AllEndpointsFailed { total });
        }
        let _ = ready_tx.send(Ok(live));

        let result = drive(&reactor, &endpoints, &mut self.shutdown_rx, total).await;

        for endpoint in &mut endpoints {
            endpoint.close();
        }
        reactor.stop();
        result
    }
}

/// Turn the reactor until shutdown, or until every endpoint has failed.
/// `total` is the number of configured endpoints, reported on failure.
async fn drive(
    reactor: &Reactor,
    endpoints: &[Box<dyn Endpoint>],
    shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
    total: usize,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            _ = reactor.turn() => {}
        }
        if endpoints.iter().all(|e| e.state() == EndpointState::Failed) {
            error!(total, "Every endpoint has failed, stopping ingestion");
            return Err(DaemonError::AllEndpointsFailed { total });
        }
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error("all {total} endpoints failed")]
    AllEndpointsFailed { total: usize },

    #[error("reactor thread exited unexpectedly")]
    ReactorExited,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::DatagramEndpoint;
    use eventgate_config::EndpointConfig;
    use std::io;
    use std::os::unix::net::UnixDatagram;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.control.enabled = false;
        config.endpoints = vec![EndpointConfig::datagram(
            "queue",
            dir.path().join("queue.sock").to_str().unwrap(),
        )];
        config
    }

    #[tokio::test]
    async fn test_daemon_creation() {
        let dir = TempDir::new().unwrap();
        let mut daemon = Daemon::new(config_in(&dir));
        assert_eq!(daemon.monitors().len(), 1);
        assert_eq!(daemon.statuses()[0].state, EndpointState::Created);
        assert!(daemon.take_events().is_some());
        assert!(daemon.take_events().is_none());
    }

    #[tokio::test]
    async fn test_zero_queue_capacity_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.daemon.queue_capacity = 0;
        let daemon = Daemon::new(config);
        assert_eq!(daemon.queue.capacity(), 1);
    }

    #[tokio::test]
    async fn test_daemon_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(config_in(&dir));
        daemon.shutdown();
    }

    #[tokio::test]
    async fn test_no_endpoints_is_a_startup_error() {
        let mut config = AppConfig::default();
        config.endpoints.clear();
        let daemon = Daemon::new(config);
        assert!(matches!(daemon.run().await, Err(DaemonError::Startup(_))));
    }

    #[tokio::test]
    async fn test_all_endpoints_failing_stops_startup() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        std::fs::write(&config.endpoints[0].path, b"not a socket").unwrap();

        let daemon = Daemon::new(config);
        let result = tokio::time::timeout(Duration::from_secs(5), daemon.run())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(DaemonError::AllEndpointsFailed { total: 1 })
        ));
        assert_eq!(daemon.statuses()[0].state, EndpointState::Failed);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let path = PathBuf::from(&config.endpoints[0].path);
        let daemon = Arc::new(Daemon::new(config));

        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while daemon.statuses()[0].state != EndpointState::Running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(path.exists());

        daemon.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(daemon.statuses()[0].state, EndpointState::Closed);
        assert!(!path.exists());
    }

    /// A running datagram endpoint whose first reads fail with `ENOTSOCK`.
    fn doomed(reactor: &Reactor, sink: &Arc<dyn EventSink>, path: &Path) -> DatagramEndpoint {
        let mut config = EndpointConfig::datagram("doomed", path.to_str().unwrap());
        config.fatal_error_threshold = 1;
        let mut endpoint = DatagramEndpoint::new(config, reactor.handle(), Arc::clone(sink));
        endpoint
            .configure_faulty([io::Error::from_raw_os_error(libc::ENOTSOCK)])
            .unwrap();
        endpoint.run().unwrap();
        // Readable, so the reactor reaches the failing read.
        UnixDatagram::unbound()
            .unwrap()
            .send_to(b"x", path)
            .unwrap();
        endpoint
    }

    #[tokio::test]
    async fn test_ingestion_ends_once_every_endpoint_failed() {
        let dir = TempDir::new().unwrap();
        let reactor = Reactor::new(16);
        let (queue, _events) = bounded(8);
        let sink: Arc<dyn EventSink> = Arc::new(queue);
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let a = dir.path().join("a.sock");
        let b = dir.path().join("b.sock");
        let endpoints: Vec<Box<dyn Endpoint>> = vec![
            Box::new(doomed(&reactor, &sink, &a)),
            Box::new(doomed(&reactor, &sink, &b)),
        ];

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            drive(&reactor, &endpoints, &mut shutdown_rx, 3),
        )
        .await
        .unwrap();
        assert!(matches!(
            result,
            Err(DaemonError::AllEndpointsFailed { total: 3 })
        ));
        assert!(endpoints.iter().all(|e| e.state() == EndpointState::Failed));
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(reactor.is_empty());
    }

    #[tokio::test]
    async fn test_ingestion_outlives_a_single_failure() {
        let dir = TempDir::new().unwrap();
        let reactor = Reactor::new(16);
        let (queue, mut events) = bounded(8);
        let sink: Arc<dyn EventSink> = Arc::new(queue);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let healthy_path = dir.path().join("healthy.sock");
        let mut healthy = DatagramEndpoint::new(
            EndpointConfig::datagram("healthy", healthy_path.to_str().unwrap()),
            reactor.handle(),
            Arc::clone(&sink),
        );
        healthy.configure().unwrap();
        healthy.run().unwrap();
        let doomed_path = dir.path().join("doomed.sock");
        let failing = doomed(&reactor, &sink, &doomed_path);
        let doomed_monitor = Arc::clone(failing.monitor());
        let endpoints: Vec<Box<dyn Endpoint>> = vec![Box::new(healthy), Box::new(failing)];

        let observer = async {
            while doomed_monitor.state() != EndpointState::Failed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            UnixDatagram::unbound()
                .unwrap()
                .send_to(b"still here", &healthy_path)
                .unwrap();
            let event = events.recv().await.unwrap();
            let _ = shutdown_tx.send(ShutdownSignal);
            event
        };
        let (result, event) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(drive(&reactor, &endpoints, &mut shutdown_rx, 2), observer)
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(event.payload, b"still here");
        assert_eq!(endpoints[0].state(), EndpointState::Running);
        assert!(!doomed_path.exists());
        assert!(healthy_path.exists());
    }
}
