//! Daemon test helpers.
//!
//! [`TestDaemon`] runs a real [`Daemon`] with sockets in a temporary
//! directory and hands the test its event receiver.

use std::sync::Arc;
use std::time::Duration;

use eventgate_config::AppConfig;
use eventgate_core::daemon::{Daemon, DaemonError};
use eventgate_core::{EndpointState, Event};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::TestConfigBuilder;
use crate::sockets::SocketDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running daemon plus the temp directory holding its sockets.
///
/// The directory is deleted when this value is dropped, guaranteeing
/// cleanup even on panic.
pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub events: mpsc::Receiver<Event>,
    pub sockets: SocketDir,
    handle: JoinHandle<Result<(), DaemonError>>,
}

impl TestDaemon {
    /// Build a config with `build` and start the daemon. Returns once every
    /// endpoint is running or has failed.
    pub async fn start(
        build: impl FnOnce(TestConfigBuilder, &SocketDir) -> TestConfigBuilder,
    ) -> Self {
        let sockets = SocketDir::new();
        let config = build(TestConfigBuilder::new(), &sockets).build();
        Self::start_with(config, sockets).await
    }

    pub async fn start_with(config: AppConfig, sockets: SocketDir) -> Self {
        let mut daemon = Daemon::new(config);
        let events = daemon.take_events().expect("fresh daemon has a receiver");
        let daemon = Arc::new(daemon);

        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { runner.run().await });

        let settled = tokio::time::timeout(STARTUP_TIMEOUT, async {
            loop {
                let pending = daemon.statuses().iter().any(|s| {
                    matches!(s.state, EndpointState::Created | EndpointState::Configured)
                });
                if !pending || handle.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        settled.expect("daemon did not settle in time");
        debug!(endpoints = daemon.monitors().len(), "Test daemon settled");

        Self {
            daemon,
            events,
            sockets,
            handle,
        }
    }

    /// Wait for the next event from the daemon's queue.
    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(STARTUP_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event queue closed")
    }

    /// Wait until the daemon exits. The socket directory stays in place so
    /// the test can inspect what was left behind.
    pub async fn join(&mut self) -> Result<(), DaemonError> {
        tokio::time::timeout(STARTUP_TIMEOUT, &mut self.handle)
            .await
            .expect("daemon did not exit in time")
            .expect("daemon task panicked")
    }

    /// Request shutdown and wait for the daemon to exit.
    pub async fn stop(&mut self) -> Result<(), DaemonError> {
        self.daemon.shutdown();
        self.join().await
    }
}
