//! Log capture for tests.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: eventgate crates at debug,
/// everything else (hyper, axum) at warn.
pub const DEFAULT_TEST_FILTER: &str = "warn,eventgate_core=debug,eventgate_config=debug";

/// Route tracing output through the test harness so it shows up only for
/// failing tests. Every test may call this; only the first call installs
/// the subscriber.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_TEST_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}
