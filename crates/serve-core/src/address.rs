//! Listen address grammar.
//!
//! An address is written as a family name, optionally followed by a single
//! space and a family-specific remainder:
//!
//! ```text
//! inet 127.0.0.1 8080
//! inet6 ::1 8080
//! unix /run/serve.sock
//! vsock 8080 3
//! x25 1234567
//! ```
//!
//! `inet`, `inet6` and `unix` may be given without a remainder, in which case
//! they bind the wildcard address on [`DEFAULT_PORT`] or [`DEFAULT_UNIX_PATH`].

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::AddressError;

/// Port used when an inet/inet6 address does not name one.
pub const DEFAULT_PORT: u16 = 4869;

/// Socket path used by a bare `unix` address.
pub const DEFAULT_UNIX_PATH: &str = "serve.sock";

/// Size of `sockaddr_un::sun_path`, including the terminating NUL.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub const UNIX_PATH_MAX: usize = 104;
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
pub const UNIX_PATH_MAX: usize = 108;

/// Longest textual IPv6 address (`INET6_ADDRSTRLEN - 1`).
const INET6_TEXT_MAX: usize = 45;

/// Longest X.25 address in digits.
const X25_DIGITS_MAX: usize = 15;

// ============================================================================
// Listen Address
// ============================================================================

/// A parsed listening address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ListenAddress {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    Unix(PathBuf),
    /// Linux virtual socket; `port` comes first in the textual form.
    Vsock { port: u32, cid: u32 },
    X25(String),
}

impl ListenAddress {
    /// Returns the family keyword used in the textual form.
    pub fn family(&self) -> &'static str {
        match self {
            Self::Inet(_) => "inet",
            Self::Inet6(_) => "inet6",
            Self::Unix(_) => "unix",
            Self::Vsock { .. } => "vsock",
            Self::X25(_) => "x25",
        }
    }
}

impl Default for ListenAddress {
    fn default() -> Self {
        Self::Inet(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
    }
}

impl FromStr for ListenAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, rest) = match s.split_once(' ') {
            Some((family, rest)) => (family, Some(rest).filter(|r| !r.is_empty())),
            None => (s, None),
        };

        match family {
            "inet" => parse_inet(rest),
            "inet6" => parse_inet6(rest),
            "unix" => parse_unix(rest),
            "vsock" => parse_vsock(rest.unwrap_or("")),
            "x25" => parse_x25(rest.unwrap_or("")),
            other => Err(AddressError::UnsupportedFamily {
                family: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ListenAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "inet {} {}", addr.ip(), addr.port()),
            Self::Inet6(addr) => write!(f, "inet6 {} {}", addr.ip(), addr.port()),
            Self::Unix(path) => write!(f, "unix {}", path.display()),
            Self::Vsock { port, cid } => write!(f, "vsock {port} {cid}"),
            Self::X25(addr) => write!(f, "x25 {addr}"),
        }
    }
}

fn parse_port(input: &str) -> Result<u16, AddressError> {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::PortNotNumeric {
            input: input.to_string(),
        });
    }
    input.parse().map_err(|_| AddressError::PortOutOfRange)
}

fn parse_inet(rest: Option<&str>) -> Result<ListenAddress, AddressError> {
    let Some(rest) = rest else {
        return Ok(ListenAddress::default());
    };
    let invalid = || AddressError::InvalidInet {
        input: rest.to_string(),
    };

    let (host, port) = rest.split_once(' ').ok_or_else(invalid)?;
    let ip: Ipv4Addr = host.parse().map_err(|_| invalid())?;
    Ok(ListenAddress::Inet(SocketAddrV4::new(ip, parse_port(port)?)))
}

fn parse_inet6(rest: Option<&str>) -> Result<ListenAddress, AddressError> {
    let Some(rest) = rest else {
        return Ok(ListenAddress::Inet6(SocketAddrV6::new(
            Ipv6Addr::UNSPECIFIED,
            DEFAULT_PORT,
            0,
            0,
        )));
    };
    let invalid = || AddressError::InvalidInet6 {
        input: rest.to_string(),
    };

    let (host, port) = rest.split_once(' ').ok_or_else(invalid)?;
    if host.len() > INET6_TEXT_MAX {
        return Err(invalid());
    }
    let ip: Ipv6Addr = host.parse().map_err(|_| invalid())?;
    Ok(ListenAddress::Inet6(SocketAddrV6::new(
        ip,
        parse_port(port)?,
        0,
        0,
    )))
}

fn parse_unix(rest: Option<&str>) -> Result<ListenAddress, AddressError> {
    let path = rest.unwrap_or(DEFAULT_UNIX_PATH);
    // sun_path must keep room for the terminating NUL
    if path.len() >= UNIX_PATH_MAX {
        return Err(AddressError::UnixPathTooLong {
            path: path.to_string(),
            max: UNIX_PATH_MAX - 1,
        });
    }
    Ok(ListenAddress::Unix(PathBuf::from(path)))
}

fn parse_vsock(rest: &str) -> Result<ListenAddress, AddressError> {
    let mut fields = rest.split_whitespace();
    let port = fields.next().ok_or(AddressError::VsockEmpty)?;
    let port = port.parse().map_err(|_| AddressError::VsockPort)?;
    let cid = fields
        .next()
        .and_then(|cid| cid.parse().ok())
        .ok_or(AddressError::VsockCid)?;
    Ok(ListenAddress::Vsock { port, cid })
}

fn parse_x25(rest: &str) -> Result<ListenAddress, AddressError> {
    if rest.len() > X25_DIGITS_MAX {
        return Err(AddressError::X25TooLong {
            input: rest.to_string(),
        });
    }
    if !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::X25Forbidden {
            input: rest.to_string(),
        });
    }
    Ok(ListenAddress::X25(rest.to_string()))
}

// ============================================================================
// Socket Kind
// ============================================================================

/// Connection-oriented socket types the listener can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    #[default]
    Stream,
    SeqPacket,
}

impl FromStr for SocketKind {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Self::Stream),
            "seqpacket" => Ok(Self::SeqPacket),
            other => Err(AddressError::UnsupportedSocketType {
                input: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::SeqPacket => f.write_str("seqpacket"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_inet_wildcard() {
        let addr = ListenAddress::default();
        assert_eq!(addr.to_string(), "inet 0.0.0.0 4869");
    }

    #[test]
    fn test_parse_inet() {
        let addr: ListenAddress = "inet 127.0.0.1 8080".parse().unwrap();
        assert_eq!(
            addr,
            ListenAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080))
        );
        assert_eq!("inet".parse::<ListenAddress>().unwrap(), ListenAddress::default());
    }

    #[test]
    fn test_parse_inet_errors() {
        assert!(matches!(
            "inet 127.0.0.1".parse::<ListenAddress>(),
            Err(AddressError::InvalidInet { .. })
        ));
        assert!(matches!(
            "inet 300.0.0.1 80".parse::<ListenAddress>(),
            Err(AddressError::InvalidInet { .. })
        ));
        assert_eq!(
            "inet 127.0.0.1 65536".parse::<ListenAddress>(),
            Err(AddressError::PortOutOfRange)
        );
        assert!(matches!(
            "inet 127.0.0.1 +80".parse::<ListenAddress>(),
            Err(AddressError::PortNotNumeric { .. })
        ));
    }

    #[test]
    fn test_parse_inet6() {
        let addr: ListenAddress = "inet6 ::1 443".parse().unwrap();
        assert_eq!(
            addr,
            ListenAddress::Inet6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 0))
        );
        assert_eq!(
            "inet6".parse::<ListenAddress>().unwrap().to_string(),
            "inet6 :: 4869"
        );
        assert!(matches!(
            "inet6 ::1".parse::<ListenAddress>(),
            Err(AddressError::InvalidInet6 { .. })
        ));
        assert!(matches!(
            "inet6 ::g 1".parse::<ListenAddress>(),
            Err(AddressError::InvalidInet6 { .. })
        ));
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            "unix /run/serve.sock".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from("/run/serve.sock"))
        );
        assert_eq!(
            "unix".parse::<ListenAddress>().unwrap(),
            ListenAddress::Unix(PathBuf::from(DEFAULT_UNIX_PATH))
        );

        let long = format!("unix /{}", "a".repeat(UNIX_PATH_MAX));
        assert!(matches!(
            long.parse::<ListenAddress>(),
            Err(AddressError::UnixPathTooLong { .. })
        ));
    }

    #[test]
    fn test_parse_vsock() {
        assert_eq!(
            "vsock 5000 3".parse::<ListenAddress>().unwrap(),
            ListenAddress::Vsock { port: 5000, cid: 3 }
        );
        assert_eq!("vsock".parse::<ListenAddress>(), Err(AddressError::VsockEmpty));
        assert_eq!("vsock x 3".parse::<ListenAddress>(), Err(AddressError::VsockPort));
        assert_eq!("vsock 5000".parse::<ListenAddress>(), Err(AddressError::VsockCid));
    }

    #[test]
    fn test_parse_x25() {
        assert_eq!(
            "x25 123456".parse::<ListenAddress>().unwrap(),
            ListenAddress::X25("123456".to_string())
        );
        assert!(matches!(
            "x25 1234567890123456".parse::<ListenAddress>(),
            Err(AddressError::X25TooLong { .. })
        ));
        assert!(matches!(
            "x25 12a4".parse::<ListenAddress>(),
            Err(AddressError::X25Forbidden { .. })
        ));
    }

    #[test]
    fn test_unknown_family() {
        assert_eq!(
            "appletalk 1".parse::<ListenAddress>(),
            Err(AddressError::UnsupportedFamily {
                family: "appletalk".to_string()
            })
        );
        // family matching is exact, not by prefix
        assert!("ine 1.2.3.4 5".parse::<ListenAddress>().is_err());
        assert!("inet66 ::1 5".parse::<ListenAddress>().is_err());
    }

    #[test]
    fn test_socket_kind() {
        assert_eq!("stream".parse::<SocketKind>().unwrap(), SocketKind::Stream);
        assert_eq!("seqpacket".parse::<SocketKind>().unwrap(), SocketKind::SeqPacket);
        assert!("dgram".parse::<SocketKind>().is_err());
        assert_eq!(SocketKind::default().to_string(), "stream");
    }
}
