//! Non-blocking and close-on-exec descriptor primitives.
//!
//! Every descriptor the supervisor keeps for itself is close-on-exec, so a
//! freshly spawned worker only ever holds the three standard streams it was
//! given explicitly.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Converts a `-1`-on-error libc return value into an `io::Result`.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Sets or clears `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFL) })?;
    let wanted = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags {
        cvt(unsafe { libc::fcntl(raw, libc::F_SETFL, wanted) })?;
    }
    Ok(())
}

/// Returns whether `O_NONBLOCK` is set on a descriptor.
pub fn is_nonblocking(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Sets `FD_CLOEXEC` on a descriptor.
pub fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFD) })?;
    if flags & libc::FD_CLOEXEC == 0 {
        cvt(unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    }
    Ok(())
}

/// Returns whether `FD_CLOEXEC` is set on a descriptor.
pub fn is_cloexec(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) })?;
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Creates a close-on-exec pipe whose ends are both non-blocking.
///
/// Returns `(read, write)`. The write end is handed to a worker as its
/// stderr: once the pipe is full the worker's writes fail with `EAGAIN`
/// instead of stalling it until the supervisor's next tick. The read end is
/// non-blocking so the supervisor can drain it without risking a stall when
/// a grandchild still holds the write end.
pub fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;

    // SAFETY: pipe(2) succeeded, both descriptors are open and owned by nobody else
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        set_cloexec(read.as_fd())?;
        set_cloexec(write.as_fd())?;
    }

    set_nonblocking(write.as_fd(), true)?;
    set_nonblocking(read.as_fd(), true)?;
    Ok((read, write))
}

/// Creates a socket that is non-blocking and close-on-exec from birth.
pub fn socket(
    domain: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
) -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        let raw = cvt(unsafe {
            libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol)
        })?;
        // SAFETY: socket(2) returned a fresh descriptor
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let raw = cvt(unsafe { libc::socket(domain, ty, protocol) })?;
        // SAFETY: socket(2) returned a fresh descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_nonblocking(fd.as_fd(), true)?;
        set_cloexec(fd.as_fd())?;
        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_pipe_flags() {
        let (read, write) = nonblocking_pipe().unwrap();
        assert!(is_nonblocking(write.as_fd()).unwrap());
        assert!(is_nonblocking(read.as_fd()).unwrap());
        assert!(is_cloexec(read.as_fd()).unwrap());
        assert!(is_cloexec(write.as_fd()).unwrap());
    }

    #[test]
    fn test_full_pipe_does_not_block_writer() {
        let (_read, write) = nonblocking_pipe().unwrap();
        let mut writer = File::from(write);
        let chunk = [b'x'; 4096];

        // A blocking pipe would hang here once the kernel buffer is full
        let err = loop {
            if let Err(e) = writer.write(&chunk) {
                break e;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_empty_pipe_read_would_block() {
        let (read, _write) = nonblocking_pipe().unwrap();
        let mut reader = File::from(read);
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_toggle_nonblocking() {
        let (read, _write) = nonblocking_pipe().unwrap();
        set_nonblocking(read.as_fd(), false).unwrap();
        assert!(!is_nonblocking(read.as_fd()).unwrap());
        set_nonblocking(read.as_fd(), true).unwrap();
        assert!(is_nonblocking(read.as_fd()).unwrap());
    }

    #[test]
    fn test_socket_flags() {
        let sock = socket(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        assert!(is_nonblocking(sock.as_fd()).unwrap());
        assert!(is_cloexec(sock.as_fd()).unwrap());
    }
}
