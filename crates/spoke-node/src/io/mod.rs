//! Local device I/O.
//!
//! The wire payloads a peer exchanges with [`IoHandler`]:
//!
//! | Direction | Command type     | Payload                  |
//! |-----------|------------------|--------------------------|
//! | request   | `device_command` | [`DeviceCommandRequest`] |
//! | request   | `device_reading` | [`DeviceReadingRequest`] |
//! | success   | `ack`            | [`DeviceAck`]            |
//! | failure   | `error`          | [`DeviceFailure`]        |

pub mod handler;
pub mod simulated;

pub use handler::{IoHandler, Readings, READINGS_STATUS, STATES_KEY};
pub use simulated::{DeviceSpec, SimulatedBus};

use serde::{Deserialize, Serialize};
use spoke_core::ports::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAction {
    On,
    Off,
    Toggle,
}

/// Asks a node to switch one of its digital devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommandRequest {
    pub device: String,
    pub action: DeviceAction,
}

/// Asks a node for the current reading of any device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReadingRequest {
    pub device: String,
}

/// Device state after a successful request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAck {
    pub device: String,
    pub reading: Reading,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub device: String,
    pub message: String,
}
