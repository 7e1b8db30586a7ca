#![allow(unsafe_code)]
//! Raw socket options not exposed by std or tokio.
//!
//! This module uses unsafe code for `setsockopt`/`getsockopt` via libc.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;

/// Set `SO_RCVBUF` on a socket. The kernel may round or clamp the value
/// (Linux doubles it and caps it at `net.core.rmem_max`).
pub fn set_recv_buffer(socket: &impl AsRawFd, bytes: usize) -> io::Result<()> {
    let value = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // `value` outlives it; the option length matches the pointee.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const value).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read back `SO_RCVBUF`.
pub fn recv_buffer(socket: &impl AsRawFd) -> io::Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` are valid for writes and sized for SO_RCVBUF.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw mut value).cast::<libc::c_void>(),
            &raw mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(usize::try_from(value).unwrap_or(0))
}

/// Errors that mean the socket itself is no longer usable.
pub fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::ENOTCONN)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_set_and_read_recv_buffer() {
        let (a, _b) = UnixDatagram::pair().unwrap();
        set_recv_buffer(&a, 32 * 1024).unwrap();
        // The kernel may double the value; it never goes below the request.
        assert!(recv_buffer(&a).unwrap() >= 32 * 1024);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(is_fatal(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(is_fatal(&io::Error::from_raw_os_error(libc::ENOTSOCK)));
        assert!(!is_fatal(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(!is_fatal(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_fatal(&io::Error::new(io::ErrorKind::Other, "x")));
    }
}
