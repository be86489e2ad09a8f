//! Error types for address parsing and configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while parsing a listen address or socket type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The leading word is not a known address family
    #[error("Unsupported address family '{family}'")]
    UnsupportedFamily { family: String },

    /// Malformed IPv4 address part
    #[error("Invalid inet address '{input}'")]
    InvalidInet { input: String },

    /// Malformed IPv6 address part
    #[error("Invalid inet6 address '{input}'")]
    InvalidInet6 { input: String },

    /// Port is not a decimal number
    #[error("Port contains non-digit character in '{input}'")]
    PortNotNumeric { input: String },

    /// Port does not fit in 16 bits
    #[error("Port number exceeds 65535")]
    PortOutOfRange,

    /// Unix socket path does not fit in `sun_path`
    #[error("Unix socket path '{path}' is too long (max {max} bytes)")]
    UnixPathTooLong { path: String, max: usize },

    /// VSOCK address without any field
    #[error("VSOCK address string has no data")]
    VsockEmpty,

    /// VSOCK port is missing or not a number
    #[error("Could not parse VSOCK address port number")]
    VsockPort,

    /// VSOCK context identifier is missing or not a number
    #[error("Could not parse VSOCK context identifier")]
    VsockCid,

    /// X.25 address longer than 15 digits
    #[error("X25 address '{input}' is too long")]
    X25TooLong { input: String },

    /// X.25 address containing non-digits
    #[error("X25 address '{input}' has forbidden characters")]
    X25Forbidden { input: String },

    /// Socket type other than `stream` or `seqpacket`
    #[error("Unsupported socket type '{input}'")]
    UnsupportedSocketType { input: String },
}

/// Errors produced while loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unexpected fields
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
