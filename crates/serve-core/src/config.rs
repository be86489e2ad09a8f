//! Optional TOML configuration file.
//!
//! Every field is optional; command-line options take precedence over the
//! file, and built-in defaults apply to whatever neither provides.
//!
//! ```toml
//! address = "inet 127.0.0.1 8080"
//! backlog = 64
//! socket_type = "stream"
//! max_processes = 128
//! command = "cat"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::address::{ListenAddress, SocketKind};
use crate::error::ConfigError;

/// File name looked up under the user's configuration directory.
pub const CONFIG_FILE_NAME: &str = "serve.toml";

/// Contents of a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServeConfig {
    /// Listening address in the `-a` grammar
    #[serde(default)]
    pub address: Option<ListenAddress>,

    /// Listen backlog (clamped by the server)
    #[serde(default)]
    pub backlog: Option<i64>,

    /// Listener socket type
    #[serde(default)]
    pub socket_type: Option<SocketKind>,

    /// Ceiling on concurrently running workers
    #[serde(default)]
    pub max_processes: Option<usize>,

    /// Shell command run for every connection
    #[serde(default)]
    pub command: Option<String>,
}

impl ServeConfig {
    /// Returns the default configuration path (`$XDG_CONFIG_HOME/serve/serve.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("serve").join(CONFIG_FILE_NAME))
    }

    /// Parses configuration from TOML text.
    ///
    /// `origin` is only used for error messages.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Loads configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text, path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Loads the default configuration file if one exists.
    ///
    /// A missing file is not an error and yields an empty configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}
