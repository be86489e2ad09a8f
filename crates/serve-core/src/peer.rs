//! Peer addresses and the labels exported to workers.
//!
//! The label is what a worker sees in `$REMOTE` and what the operator sees
//! in `Process <pid> created (<label>)`.

use std::fmt;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

/// Address of the remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    /// `None` for unnamed (unbound) client sockets.
    Unix(Option<PathBuf>),
    Vsock { cid: u32, port: u32 },
    X25(String),
}

impl PeerAddress {
    /// Returns the human-readable label for this peer.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{} {}", addr.ip(), addr.port()),
            Self::Inet6(addr) => write!(f, "{} {}", addr.ip(), addr.port()),
            Self::Unix(Some(path)) => write!(f, "{}", path.display()),
            Self::Unix(None) => Ok(()),
            Self::Vsock { cid, port } => write!(f, "{cid} {port}"),
            Self::X25(addr) => f.write_str(addr),
        }
    }
}
