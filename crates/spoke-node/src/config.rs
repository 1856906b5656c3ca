//! TOML configuration for an appliance node.
//!
//! Default location:
//! - Windows:  `%APPDATA%\Spoke\node.toml`
//! - Linux:    `~/.config/spoke/node.toml`
//! - macOS:    `~/Library/Application Support/Spoke/node.toml`
//!
//! Example:
//!
//! ```toml
//! [node]
//! id = "0b8e7f52-2d4c-4f7e-8a55-5c1d2b3a4f60"
//! log_level = "info"
//! state_file = "/var/lib/spoke/state.toml"
//!
//! [network]
//! relay_address = "relay.example.net:7340"
//! reconnect_interval_secs = 5
//! max_idle_secs = 30
//! write_timeout_secs = 10
//!
//! [io]
//! poll_interval_ms = 1000
//!
//! [[io.devices]]
//! id = "pump"
//! kind = "digital"
//!
//! [[io.devices]]
//! id = "tank_temp"
//! kind = "analog"
//! value = 18.5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spoke_core::{ControllerConfig, RemoteConfig};
use thiserror::Error;
use uuid::Uuid;

use crate::io::DeviceSpec;

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
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub io: IoSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where commanded device states are kept.  Without one, devices start
    /// from their configured state after every restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    #[serde(default = "default_relay_address")]
    pub relay_address: String,
    /// Pause between a lost connection and the next dial.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_relay_address() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_reconnect_interval_secs() -> u64 {
    5
}
fn default_max_idle_secs() -> u64 {
    30
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            log_level: default_log_level(),
            state_file: None,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            relay_address: default_relay_address(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_idle_secs: default_max_idle_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl Default for IoSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            devices: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            remote: RemoteConfig {
                max_idle_time: Duration::from_secs(self.network.max_idle_secs),
                write_timeout: Duration::from_secs(self.network.write_timeout_secs),
            },
            ..ControllerConfig::default()
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.network.reconnect_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.io.poll_interval_ms)
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
        .map(|dir| dir.join("node.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, or the defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found"
/// and [`ConfigError::Parse`] for malformed TOML.
pub fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
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
pub fn save_config(config: &NodeConfig, path: &Path) -> Result<(), ConfigError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use spoke_core::ports::DeviceKind;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("spoke-node-test-{}", Uuid::new_v4()))
            .join("node.toml")
    }

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::default();

        assert_eq!(cfg.network.relay_address, "127.0.0.1:7340");
        assert_eq!(cfg.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert!(cfg.io.devices.is_empty());
        assert!(cfg.node.state_file.is_none());
    }

    #[test]
    fn test_device_tables_parse() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            [io]
            poll_interval_ms = 250

            [[io.devices]]
            id = "pump"
            kind = "digital"
            on = true

            [[io.devices]]
            id = "tank_temp"
            kind = "analog"
            value = 18.5
            "#,
        )
        .unwrap();

        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.io.devices.len(), 2);
        assert_eq!(cfg.io.devices[0].kind, DeviceKind::Digital);
        assert!(cfg.io.devices[0].on);
        assert_eq!(cfg.io.devices[1].value, 18.5);
    }

    #[test]
    fn test_save_then_load_keeps_identity() {
        // Arrange
        let path = scratch_path();
        let mut cfg = NodeConfig::default();
        cfg.network.relay_address = "10.0.0.2:7340".into();

        // Act
        save_config(&cfg, &path).unwrap();
        let restored = load_config(&path).unwrap();

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_max_idle_feeds_controller_config() {
        let cfg: NodeConfig = toml::from_str("[network]\nmax_idle_secs = 9\n").unwrap();

        assert_eq!(cfg.controller_config().remote.max_idle_time, Duration::from_secs(9));
    }
}
