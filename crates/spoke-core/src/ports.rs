//! Collaborator contracts consumed by handlers outside the core.
//!
//! The core persists nothing and drives no hardware.  Handlers that need a
//! settings store or a device bus receive an implementation of one of these
//! traits from the binary that wires them up.  Tests substitute the mockall
//! doubles (`MockConfigStore`, `MockDeviceBus`), which downstream crates can
//! reach through the `mocks` feature.

use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

// ── Configuration store ───────────────────────────────────────────────────────

/// Errors surfaced by a [`ConfigStore`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stored value does not have the requested shape.
    #[error("config key '{key}' has an unexpected shape: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The backing storage could not be read or written.
    #[error("config storage failed: {0}")]
    Storage(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key-value settings store.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
pub trait ConfigStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`.  The change may stay in memory until
    /// [`sync`](Self::sync) is called.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the store rejects the value.
    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError>;

    /// Flushes pending changes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the backing storage cannot be written.
    fn sync(&self) -> Result<(), ConfigError>;
}

/// Typed helpers available on every [`ConfigStore`].
pub trait ConfigStoreExt: ConfigStore {
    /// Reads `key` as `T`.  A missing key yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the stored value is not a `T`.
    fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| {
                serde_json::from_value(value).map_err(|source| ConfigError::InvalidValue {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Stores `value` under `key` in its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `value` cannot be serialised or stored.
    fn set_struct<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let value = serde_json::to_value(value).map_err(|source| ConfigError::InvalidValue {
            key: key.to_string(),
            source,
        })?;
        self.set(key, value)
    }
}

impl<S: ConfigStore + ?Sized> ConfigStoreExt for S {}

// ── Devices ───────────────────────────────────────────────────────────────────

/// Errors surfaced by devices and device buses.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    /// A switching operation was requested on a read-only device.
    #[error("device '{0}' is not digital")]
    NotDigital(String),

    #[error("device bus is not initialised")]
    NotInitialized,

    /// The driver reported a failure.
    #[error("device failure: {0}")]
    Hardware(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Digital,
    Analog,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Digital => f.write_str("digital"),
            DeviceKind::Analog => f.write_str("analog"),
        }
    }
}

/// An on/off device such as a relay output.
pub trait DigitalDevice: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Digital
    }

    fn turn_on(&self) -> Result<(), DeviceError>;
    fn turn_off(&self) -> Result<(), DeviceError>;
    fn toggle(&self) -> Result<(), DeviceError>;

    /// Returns `true` when the device is on.
    fn status(&self) -> Result<bool, DeviceError>;
}

/// A read-only measuring device such as a temperature probe.
pub trait AnalogDevice: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Analog
    }

    fn value(&self) -> Result<f64, DeviceError>;
}

/// Current reading of one device, as carried in status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Digital(bool),
    Analog(f64),
}

/// Handle to one device on a bus.
#[derive(Clone)]
pub enum Device {
    Digital(Arc<dyn DigitalDevice>),
    Analog(Arc<dyn AnalogDevice>),
}

impl Device {
    pub fn id(&self) -> &str {
        match self {
            Device::Digital(d) => d.id(),
            Device::Analog(a) => a.id(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Digital(d) => d.kind(),
            Device::Analog(a) => a.kind(),
        }
    }

    /// Reads the device's current state.
    ///
    /// # Errors
    ///
    /// Propagates the driver's [`DeviceError`].
    pub fn reading(&self) -> Result<Reading, DeviceError> {
        match self {
            Device::Digital(d) => d.status().map(Reading::Digital),
            Device::Analog(a) => a.value().map(Reading::Analog),
        }
    }

    /// Returns the digital interface, or [`DeviceError::NotDigital`].
    ///
    /// # Errors
    ///
    /// Fails for analog devices.
    pub fn as_digital(&self) -> Result<&Arc<dyn DigitalDevice>, DeviceError> {
        match self {
            Device::Digital(d) => Ok(d),
            Device::Analog(a) => Err(DeviceError::NotDigital(a.id().to_string())),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// A collection of devices behind one driver.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
pub trait DeviceBus: Send + 'static {
    /// Brings the bus up.  `config` is driver-specific.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if the driver cannot start.
    fn initialize(&mut self, config: &Value) -> Result<(), DeviceError>;

    /// Releases the bus.  Safe to call on a bus that never initialised.
    fn deinitialize(&mut self);

    /// Looks a device up by id.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::UnknownDevice`] for an id not on this bus.
    fn device(&self, id: &str) -> Result<Device, DeviceError>;

    fn device_ids(&self) -> Vec<String>;

    /// Channel of ids whose state changed, for buses that can push changes.
    /// Buses that can only be polled return `None`.
    fn device_changes(&mut self) -> Option<mpsc::Receiver<String>>;
}
