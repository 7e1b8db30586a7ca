//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use eventgate_config::{AppConfig, EndpointConfig};

use crate::sockets::SocketDir;

/// Fluent builder for [`AppConfig`] in tests.
///
/// Starts with no endpoints and the control socket disabled, so nothing
/// touches the default paths under `/tmp/eventgate`.
///
/// # Example
///
/// ```ignore
/// let dir = SocketDir::new();
/// let config = TestConfigBuilder::new()
///     .datagram(&dir, "queue")
///     .queue_capacity(8)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.endpoints.clear();
        config.control.enabled = false;
        Self { config }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.daemon.queue_capacity = capacity;
        self
    }

    pub fn max_dispatch_per_turn(mut self, n: usize) -> Self {
        self.config.daemon.max_dispatch_per_turn = n;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    /// Enable the control socket at `control.sock` inside `dir`.
    pub fn control(mut self, dir: &SocketDir) -> Self {
        self.config.control.enabled = true;
        self.config.control.socket_path = dir.path_str("control.sock");
        self
    }

    /// Add a whole-message datagram endpoint at `<name>.sock` inside `dir`.
    pub fn datagram(self, dir: &SocketDir, name: &str) -> Self {
        let path = dir.path_str(&format!("{name}.sock"));
        self.endpoint(EndpointConfig::datagram(name, &path))
    }

    /// Add a newline-delimited stream endpoint at `<name>.sock` inside `dir`.
    pub fn stream(self, dir: &SocketDir, name: &str) -> Self {
        let path = dir.path_str(&format!("{name}.sock"));
        self.endpoint(EndpointConfig::stream(name, &path))
    }

    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.config.endpoints.push(endpoint);
        self
    }

    /// Adjust the most recently added endpoint.
    pub fn with_last(mut self, tweak: impl FnOnce(&mut EndpointConfig)) -> Self {
        if let Some(last) = self.config.endpoints.last_mut() {
            tweak(last);
        }
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
