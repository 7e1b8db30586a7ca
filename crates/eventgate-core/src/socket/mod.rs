//! Unix socket path ownership.
//!
//! A [`SocketPath`] is the exclusive claim an endpoint holds on one
//! filesystem path. Claiming validates the path, refuses to clobber
//! anything that is not a socket, refuses to steal a socket another process
//! is still serving, and unlinks stale sockets left by a crashed run.
//! Dropping (or [`release`](SocketPath::release)-ing) the claim unlinks
//! the path, so every exit path of `configure()` and `close()` cleans up.
//!
//! # Invariants
//!
//! - A regular file, directory, or symlink at the path is never removed.
//! - Permissions are set explicitly after bind, never inherited from umask.

pub mod sys;

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use eventgate_config::MAX_SOCKET_PATH_LEN;
use tracing::{debug, info, warn};

/// Errors from claiming, binding, or configuring a socket path.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket path {0} is not absolute")]
    NotAbsolute(PathBuf),

    #[error(
        "socket path {path} is {len} bytes, longer than the {}-byte limit",
        MAX_SOCKET_PATH_LEN
    )]
    TooLong { path: PathBuf, len: usize },

    #[error("{0} already exists and is not a socket")]
    Collision(PathBuf),

    #[error("{0} is in use by a running process")]
    InUse(PathBuf),

    #[error("cannot tell whether {path} is still in use: {source}")]
    Unverified { path: PathBuf, source: io::Error },

    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl SocketError {
    pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        SocketError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Exclusive claim on a socket path; unlinks the path when dropped.
#[derive(Debug)]
pub struct SocketPath {
    path: PathBuf,
    released: bool,
}

impl SocketPath {
    /// Claim `path` for a new socket.
    ///
    /// Creates missing parent directories. A stale socket (connects are
    /// refused) is unlinked. A live socket, a socket whose state the check
    /// could not determine, and any non-socket entry are errors and are
    /// left untouched.
    pub fn claim(path: &Path) -> Result<Self, SocketError> {
        if !path.is_absolute() {
            return Err(SocketError::NotAbsolute(path.to_path_buf()));
        }
        let len = path.as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            return Err(SocketError::TooLong {
                path: path.to_path_buf(),
                len,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SocketError::io("create directory", parent, e))?;
        }

        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SocketError::io("inspect", path, e)),
            Ok(meta) if !meta.file_type().is_socket() => {
                return Err(SocketError::Collision(path.to_path_buf()));
            }
            Ok(_) => match check_peer(path) {
                Peer::Live => return Err(SocketError::InUse(path.to_path_buf())),
                Peer::Unknown(source) => {
                    return Err(SocketError::Unverified {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                Peer::Stale => {
                    fs::remove_file(path)
                        .map_err(|e| SocketError::io("unlink stale", path, e))?;
                    info!(path = %path.display(), "Removed stale socket");
                }
            },
        }

        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind a datagram socket at this path, in non-blocking mode.
    pub fn bind_datagram(&self) -> Result<UnixDatagram, SocketError> {
        let socket =
            UnixDatagram::bind(&self.path).map_err(|e| SocketError::io("bind", &self.path, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| SocketError::io("set non-blocking", &self.path, e))?;
        Ok(socket)
    }

    /// Bind a stream listener at this path, in non-blocking mode.
    pub fn bind_listener(&self) -> Result<UnixListener, SocketError> {
        let listener =
            UnixListener::bind(&self.path).map_err(|e| SocketError::io("bind", &self.path, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| SocketError::io("set non-blocking", &self.path, e))?;
        Ok(listener)
    }

    /// Set the file mode of the bound socket.
    pub fn set_mode(&self, mode: u32) -> Result<(), SocketError> {
        fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))
            .map_err(|e| SocketError::io("set permissions on", &self.path, e))
    }

    /// Hand the socket file to a group, keeping the owner.
    pub fn set_group(&self, gid: u32) -> Result<(), SocketError> {
        std::os::unix::fs::chown(&self.path, None, Some(gid))
            .map_err(|e| SocketError::io("change group of", &self.path, e))
    }

    /// Unlink the path now instead of on drop.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for SocketPath {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match remove_if_present(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Socket path removed"),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove socket path")
            }
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// What connecting to an existing socket file says about it.
#[derive(Debug)]
enum Peer {
    Live,
    Stale,
    Unknown(io::Error),
}

/// A datagram socket accepts `connect` while bound; a listener accepts a
/// stream connection. Only a refused connect proves nobody is serving.
fn check_peer(path: &Path) -> Peer {
    let datagram = match UnixDatagram::unbound().and_then(|p| p.connect(path)) {
        Ok(()) => return Peer::Live,
        Err(e) => e,
    };
    match UnixStream::connect(path) {
        Ok(_) => Peer::Live,
        Err(stream) => classify(datagram, stream),
    }
}

/// Judge a socket both connects failed on. `EPROTOTYPE` only means the
/// socket is of the other type; anything else, such as `EACCES` on a
/// socket owned by another user, proves nothing.
fn classify(datagram: io::Error, stream: io::Error) -> Peer {
    let refused =
        |e: &io::Error| matches!(e.raw_os_error(), Some(libc::ECONNREFUSED | libc::ENOENT));
    let wrong_type = |e: &io::Error| e.raw_os_error() == Some(libc::EPROTOTYPE);

    let datagram_clean = refused(&datagram) || wrong_type(&datagram);
    let stream_clean = refused(&stream) || wrong_type(&stream);
    if datagram_clean && stream_clean && (refused(&datagram) || refused(&stream)) {
        Peer::Stale
    } else if !datagram_clean {
        Peer::Unknown(datagram)
    } else {
        Peer::Unknown(stream)
    }
}
