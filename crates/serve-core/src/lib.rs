//! serve core - shared types for the serve utility
//!
//! This crate holds the pure, OS-independent parts of the server:
//! - `address` - the listen address grammar and socket kinds
//! - `peer` - peer addresses and the labels handed to workers
//! - `config` - the optional TOML configuration file
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()` or `todo!()` outside tests.

pub mod address;
pub mod config;
pub mod error;
pub mod peer;

// Re-exports for convenience
pub use address::{ListenAddress, SocketKind, DEFAULT_PORT, DEFAULT_UNIX_PATH, UNIX_PATH_MAX};
pub use config::ServeConfig;
pub use error::{AddressError, ConfigError};
pub use peer::PeerAddress;
