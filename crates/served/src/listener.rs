//! Listener setup and the configured worker command.
//!
//! The listener is bound once at startup and stays open for the lifetime of
//! the supervisor. It is non-blocking and close-on-exec, so workers never
//! inherit it. A unix socket file created by the listener is removed again
//! when the listener is dropped.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use serve_core::{ListenAddress, PeerAddress, SocketKind};

use crate::nbio::{self, cvt};
use crate::sockaddr::{self, RawAddress};

/// Shell used to run worker commands.
pub const SHELL: &str = "sh";

/// Clamps a requested backlog into `[0, SOMAXCONN]`.
pub fn clamp_backlog(requested: i64) -> i32 {
    // SOMAXCONN always fits in an i32
    requested.clamp(0, i64::from(libc::SOMAXCONN)) as i32
}

/// Errors that can occur while setting up the listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Could not encode listening address {address}: {source}")]
    Address {
        address: ListenAddress,
        #[source]
        source: io::Error,
    },

    #[error("Could not create listener socket for {address}: {source}")]
    Socket {
        address: ListenAddress,
        #[source]
        source: io::Error,
    },

    #[error("Could not assign address {address} to listener socket: {source}")]
    Bind {
        address: ListenAddress,
        #[source]
        source: io::Error,
    },

    #[error("Could not mark {address} as accepting connections: {source}")]
    Listen {
        address: ListenAddress,
        #[source]
        source: io::Error,
    },
}

/// A bound, listening, non-blocking socket.
#[derive(Debug)]
pub struct Listener {
    /// The listening descriptor
    fd: OwnedFd,

    /// Address the listener was bound to
    address: ListenAddress,

    /// Absolute path of the unix socket file we created, if any
    socket_path: Option<PathBuf>,
}

impl Listener {
    /// Creates, binds and starts listening on `address`.
    ///
    /// For unix addresses a stale socket file at the path is removed first.
    /// Any other kind of file at that path is left alone and binding fails.
    pub fn bind(
        address: &ListenAddress,
        kind: SocketKind,
        backlog: i32,
    ) -> Result<Self, ListenerError> {
        let raw = sockaddr::encode(address).map_err(|source| ListenerError::Address {
            address: address.clone(),
            source,
        })?;

        let ty = match kind {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::SeqPacket => libc::SOCK_SEQPACKET,
        };
        let fd = nbio::socket(raw.family(), ty, 0).map_err(|source| ListenerError::Socket {
            address: address.clone(),
            source,
        })?;

        let socket_path = match address {
            ListenAddress::Unix(path) => {
                remove_stale_socket(path);
                Some(absolute(path))
            }
            _ => None,
        };

        cvt(unsafe { libc::bind(fd.as_raw_fd(), raw.as_ptr(), raw.len()) }).map_err(
            |source| ListenerError::Bind {
                address: address.clone(),
                source,
            },
        )?;

        let listener = Self {
            fd,
            address: address.clone(),
            socket_path,
        };

        cvt(unsafe { libc::listen(listener.fd.as_raw_fd(), backlog) }).map_err(|source| {
            ListenerError::Listen {
                address: address.clone(),
                source,
            }
        })?;

        info!(address = %address, socket_type = %kind, backlog, "Listener ready");
        Ok(listener)
    }

    /// Returns the address the listener was configured with.
    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    /// Returns the address the kernel actually bound (resolves port 0).
    pub fn local_address(&self) -> io::Result<PeerAddress> {
        let mut raw = RawAddress::empty();
        cvt(unsafe {
            libc::getsockname(self.fd.as_raw_fd(), raw.as_mut_ptr(), raw.len_mut())
        })?;
        sockaddr::decode(&raw)
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path {
            if let Err(e) = fs::remove_file(path) {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
            } else {
                debug!(socket = %path.display(), "Removed socket file");
            }
        }
    }
}

/// Removes a leftover unix socket so `bind(2)` can reuse the path.
fn remove_stale_socket(path: &Path) {
    let is_socket = fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false);
    if is_socket {
        match fs::remove_file(path) {
            Ok(()) => debug!(socket = %path.display(), "Removed stale socket file"),
            Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove stale socket"),
        }
    }
}

/// Resolves `path` against the current directory so cleanup still works
/// after the process changes directory (daemon mode).
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

// ============================================================================
// Worker Command
// ============================================================================

/// The shell command every worker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand(String);

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds `sh -c <command>` with no redirections applied yet.
    pub fn command(&self) -> Command {
        let mut command = Command::new(SHELL);
        command.arg("-c").arg(&self.0);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_clamp_backlog() {
        assert_eq!(clamp_backlog(-5), 0);
        assert_eq!(clamp_backlog(16), 16);
        assert_eq!(clamp_backlog(i64::MAX), libc::SOMAXCONN);
    }

    #[test]
    fn test_bind_inet_ephemeral_port() {
        let address: ListenAddress = "inet 127.0.0.1 0".parse().unwrap();
        let listener = Listener::bind(&address, SocketKind::Stream, 8).unwrap();

        match listener.local_address().unwrap() {
            PeerAddress::Inet(addr) => {
                assert_eq!(addr.ip().to_string(), "127.0.0.1");
                assert_ne!(addr.port(), 0);
            }
            other => panic!("unexpected local address {other:?}"),
        }
        assert!(nbio::is_nonblocking(listener.as_fd()).unwrap());
        assert!(nbio::is_cloexec(listener.as_fd()).unwrap());
    }

    #[test]
    fn test_unix_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.sock");
        let address = ListenAddress::Unix(path.clone());

        let listener = Listener::bind(&address, SocketKind::Stream, 8).unwrap();
        assert!(path.exists());
        UnixStream::connect(&path).unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        let address = ListenAddress::Unix(path.clone());

        let first = Listener::bind(&address, SocketKind::Stream, 8).unwrap();
        // Leak the first listener's cleanup so the socket file stays behind
        std::mem::forget(first);
        assert!(path.exists());

        let second = Listener::bind(&address, SocketKind::Stream, 8).unwrap();
        UnixStream::connect(&path).unwrap();
        drop(second);
    }

    #[test]
    fn test_regular_file_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        fs::write(&path, b"keep me").unwrap();

        let result = Listener::bind(&ListenAddress::Unix(path.clone()), SocketKind::Stream, 8);
        assert!(matches!(result, Err(ListenerError::Bind { .. })));
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_shell_command() {
        let command = ShellCommand::new("echo hi");
        let built = command.command();
        assert_eq!(built.get_program(), SHELL);
        let args: Vec<_> = built.get_args().collect();
        assert_eq!(args, ["-c", "echo hi"]);
        assert_eq!(command.as_str(), "echo hi");
    }
}
