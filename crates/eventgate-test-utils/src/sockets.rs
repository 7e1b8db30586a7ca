//! Socket fixtures.
//!
//! Unix socket paths are limited to ~104 bytes, so tests keep every socket
//! in a short-lived [`SocketDir`] directly under the system temp directory.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A temporary directory for socket files, removed on drop.
pub struct SocketDir {
    dir: TempDir,
}

impl SocketDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::Builder::new()
                .prefix("eg")
                .tempdir()
                .expect("failed to create socket dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a socket named `name` inside the directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Like [`path`](Self::path), as the string form config files use.
    pub fn path_str(&self, name: &str) -> String {
        self.path(name)
            .to_str()
            .expect("temp paths are UTF-8")
            .to_string()
    }
}

impl Default for SocketDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Send one datagram to the socket at `path` from an unbound socket.
pub fn send_datagram(path: &Path, payload: &[u8]) {
    let peer = UnixDatagram::unbound().expect("failed to create peer socket");
    peer.send_to(payload, path).expect("failed to send datagram");
}
