//! Accepting connections and labelling their peers.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use serve_core::PeerAddress;

use crate::nbio::{self, cvt};
use crate::sockaddr::{self, RawAddress};

/// Accepts one pending connection from a listening socket.
///
/// The returned descriptor is close-on-exec and in blocking mode, ready to
/// become a worker's stdin/stdout. On failure the OS error is preserved so
/// callers can classify it with [`is_transient_accept_error`]; peers whose
/// address family has no label form are closed and reported as `ENOTSUP`.
pub fn accept_remote(listener: BorrowedFd<'_>) -> io::Result<(OwnedFd, PeerAddress)> {
    let mut raw = RawAddress::empty();

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let accepted = cvt(unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            raw.as_mut_ptr(),
            raw.len_mut(),
            libc::SOCK_CLOEXEC,
        )
    })?;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let accepted =
        cvt(unsafe { libc::accept(listener.as_raw_fd(), raw.as_mut_ptr(), raw.len_mut()) })?;

    // SAFETY: accept(2) returned a fresh descriptor
    let connection = unsafe { OwnedFd::from_raw_fd(accepted) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    nbio::set_cloexec(connection.as_fd())?;

    // Some platforms inherit O_NONBLOCK from the listener
    nbio::set_nonblocking(connection.as_fd(), false)?;

    let peer = sockaddr::decode(&raw)?;
    Ok((connection, peer))
}

/// Returns whether an accept failure should be ignored for this tick.
///
/// Aborted handshakes, interrupted calls and a momentarily exhausted
/// descriptor table resolve themselves; a spurious wakeup on the
/// non-blocking listener surfaces as `EWOULDBLOCK`.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNABORTED | libc::EINTR | libc::EMFILE)
    ) || err.kind() == io::ErrorKind::WouldBlock
}
