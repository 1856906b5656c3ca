//! Typed command envelope carried inside a frame payload.
//!
//! A command is a self-describing JSON object:
//!
//! ```json
//! {"type": "device_command", "data": {"device": "relay-1", "action": "toggle"}}
//! ```
//!
//! Keeping the envelope independent of framing means the same frame format
//! can carry any payload schema; only handlers care what `data` contains.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while building or reading a command envelope.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The envelope or its `data` field is not valid for the requested type.
    #[error("malformed command envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Every command type understood by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Liveness probe exchanged by both ends of a connection.
    Heartbeat,
    /// Request to tear the current connection down.
    Disconnect,
    /// One named status value changed.
    StatusUpdate,
    /// Request for the full status snapshot (and future updates).
    StatusSubscribe,
    /// Full status snapshot.
    StatusSnapshot,
    /// Switch a digital device.
    DeviceCommand,
    /// Current reading of one device.
    DeviceReading,
    /// Positive reply to a request.
    Ack,
    /// Negative reply to a request.
    Error,
}

impl CommandType {
    pub const ALL: [CommandType; 9] = [
        CommandType::Heartbeat,
        CommandType::Disconnect,
        CommandType::StatusUpdate,
        CommandType::StatusSubscribe,
        CommandType::StatusSnapshot,
        CommandType::DeviceCommand,
        CommandType::DeviceReading,
        CommandType::Ack,
        CommandType::Error,
    ];

    /// Wire name, identical to the serialised `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Heartbeat => "heartbeat",
            CommandType::Disconnect => "disconnect",
            CommandType::StatusUpdate => "status_update",
            CommandType::StatusSubscribe => "status_subscribe",
            CommandType::StatusSnapshot => "status_snapshot",
            CommandType::DeviceCommand => "device_command",
            CommandType::DeviceReading => "device_reading",
            CommandType::Ack => "ack",
            CommandType::Error => "error",
        }
    }

    /// Commands that only mean something on the link they arrive on.  A relay
    /// never passes these on to another peer.
    pub fn is_link_scoped(self) -> bool {
        matches!(self, CommandType::Heartbeat | CommandType::Disconnect)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed command with opaque JSON data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub data: Value,
}

/// Body of a [`CommandType::Disconnect`] command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub reason: String,
}

impl Command {
    /// Creates a command with no data.
    pub fn new(command_type: CommandType) -> Self {
        Self {
            command_type,
            data: Value::Null,
        }
    }

    /// Creates a command whose `data` is the JSON form of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Malformed`] if `data` cannot be serialised.
    pub fn with_data<T: Serialize>(command_type: CommandType, data: &T) -> Result<Self, CommandError> {
        Ok(Self {
            command_type,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn heartbeat() -> Self {
        Self::new(CommandType::Heartbeat)
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self {
            command_type: CommandType::Disconnect,
            data: serde_json::json!({ "reason": reason.into() }),
        }
    }

    /// Interprets `data` as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Malformed`] if `data` does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CommandError> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Serialises the envelope into frame payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Malformed`] if serialisation fails.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses frame payload bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Malformed`] if the bytes are not an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
