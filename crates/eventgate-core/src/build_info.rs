//! Build-time metadata embedded by the build script.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("EVENTGATE_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("EVENTGATE_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("EVENTGATE_BUILD_PROFILE");

/// The target triple the binary was compiled for.
pub const TARGET: &str = env!("EVENTGATE_TARGET");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version string reported by the control plane and `--version` output.
///
/// Example: `"0.1.0 (abc1234, debug, x86_64-unknown-linux-gnu)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE}, {TARGET})")
}
