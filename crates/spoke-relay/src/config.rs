//! TOML configuration for the relay.
//!
//! Default location:
//! - Windows:  `%APPDATA%\Spoke\relay.toml`
//! - Linux:    `~/.config/spoke/relay.toml`
//! - macOS:    `~/Library/Application Support/Spoke/relay.toml`
//!
//! Example:
//!
//! ```toml
//! [relay]
//! id = "6f1c2a9e-4b7d-4c52-9a1e-2f3b4c5d6e7f"
//! log_level = "info"
//!
//! [network]
//! bind_address = "0.0.0.0"
//! port = 7340
//! max_idle_secs = 30
//! write_timeout_secs = 10
//! ```
//!
//! Every field has a default, so a missing file or a partial one still yields
//! a working relay.  A missing `id` is generated; saving the config keeps it
//! stable across restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spoke_core::{ControllerConfig, RemoteConfig};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    /// Identity the relay presents to every peer.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Silence tolerated on a connection before it is dropped.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7340
}
fn default_max_idle_secs() -> u64 {
    30
}
fn default_write_timeout_secs() -> u64 {
    10
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_idle_secs: default_max_idle_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl RelayConfig {
    /// `bind_address:port`, ready for `TcpListener::bind`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }

    /// Per-connection Controller settings derived from the network section.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            remote: RemoteConfig {
                max_idle_time: Duration::from_secs(self.network.max_idle_secs),
                write_timeout: Duration::from_secs(self.network.write_timeout_secs),
            },
            ..ControllerConfig::default()
        }
    }
}

// ── Load / save ───────────────────────────────────────────────────────────────

/// Resolves the default config file path.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the platform base
/// directory cannot be determined from the environment.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("relay.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, or the defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found"
/// and [`ConfigError::Parse`] for malformed TOML.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config(config: &RelayConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Spoke"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("Spoke"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("spoke"))
    }
}
