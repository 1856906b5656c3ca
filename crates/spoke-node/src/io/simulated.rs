//! In-memory device bus.
//!
//! Stands in for real drivers on development machines and in tests.  Digital
//! devices remember their on/off state and push their id onto the change
//! channel whenever they switch; analog devices hold a value that tests (or
//! a demo loop) can move with [`SimulatedAnalog::set_value`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spoke_core::ports::{AnalogDevice, Device, DeviceBus, DeviceError, DeviceKind, DigitalDevice};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Capacity of the change channel.  A full channel drops change
/// notifications; the periodic poll still picks the state up.
const CHANGE_CAPACITY: usize = 32;

/// One device as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSpec {
    pub id: String,
    pub kind: DeviceKind,
    /// Initial state of a digital device.
    #[serde(default)]
    pub on: bool,
    /// Initial value of an analog device.
    #[serde(default)]
    pub value: f64,
}

pub struct SimulatedDigital {
    id: String,
    on: AtomicBool,
    changes: Option<mpsc::Sender<String>>,
}

impl SimulatedDigital {
    fn set(&self, on: bool) {
        if self.on.swap(on, Ordering::SeqCst) != on {
            trace!(device = %self.id, on, "simulated switch");
            if let Some(changes) = &self.changes {
                let _ = changes.try_send(self.id.clone());
            }
        }
    }
}

impl DigitalDevice for SimulatedDigital {
    fn id(&self) -> &str {
        &self.id
    }

    fn turn_on(&self) -> Result<(), DeviceError> {
        self.set(true);
        Ok(())
    }

    fn turn_off(&self) -> Result<(), DeviceError> {
        self.set(false);
        Ok(())
    }

    fn toggle(&self) -> Result<(), DeviceError> {
        self.set(!self.on.load(Ordering::SeqCst));
        Ok(())
    }

    fn status(&self) -> Result<bool, DeviceError> {
        Ok(self.on.load(Ordering::SeqCst))
    }
}

pub struct SimulatedAnalog {
    id: String,
    value: Mutex<f64>,
}

impl SimulatedAnalog {
    pub fn set_value(&self, value: f64) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl AnalogDevice for SimulatedAnalog {
    fn id(&self) -> &str {
        &self.id
    }

    fn value(&self) -> Result<f64, DeviceError> {
        Ok(*self.value.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Default)]
pub struct SimulatedBus {
    digital: BTreeMap<String, Arc<SimulatedDigital>>,
    analog: BTreeMap<String, Arc<SimulatedAnalog>>,
    changes: Option<mpsc::Receiver<String>>,
    initialized: bool,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle to an analog device, for driving test scenarios.
    pub fn analog(&self, id: &str) -> Option<Arc<SimulatedAnalog>> {
        self.analog.get(id).cloned()
    }
}

impl DeviceBus for SimulatedBus {
    /// `config` is a JSON array of [`DeviceSpec`].
    fn initialize(&mut self, config: &Value) -> Result<(), DeviceError> {
        let specs: Vec<DeviceSpec> = serde_json::from_value(config.clone())
            .map_err(|e| DeviceError::Hardware(format!("invalid device list: {e}")))?;

        let (tx, rx) = mpsc::channel(CHANGE_CAPACITY);
        self.digital.clear();
        self.analog.clear();
        for spec in specs {
            match spec.kind {
                DeviceKind::Digital => {
                    let device = SimulatedDigital {
                        id: spec.id.clone(),
                        on: AtomicBool::new(spec.on),
                        changes: Some(tx.clone()),
                    };
                    self.digital.insert(spec.id, Arc::new(device));
                }
                DeviceKind::Analog => {
                    let device = SimulatedAnalog {
                        id: spec.id.clone(),
                        value: Mutex::new(spec.value),
                    };
                    self.analog.insert(spec.id, Arc::new(device));
                }
            }
        }
        self.changes = Some(rx);
        self.initialized = true;
        debug!(digital = self.digital.len(), analog = self.analog.len(), "simulated bus up");
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.digital.clear();
        self.analog.clear();
        self.changes = None;
        self.initialized = false;
    }

    fn device(&self, id: &str) -> Result<Device, DeviceError> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if let Some(digital) = self.digital.get(id) {
            return Ok(Device::Digital(Arc::clone(digital) as Arc<dyn DigitalDevice>));
        }
        if let Some(analog) = self.analog.get(id) {
            return Ok(Device::Analog(Arc::clone(analog) as Arc<dyn AnalogDevice>));
        }
        Err(DeviceError::UnknownDevice(id.to_string()))
    }

    fn device_ids(&self) -> Vec<String> {
        self.digital.keys().chain(self.analog.keys()).cloned().collect()
    }

    fn device_changes(&mut self) -> Option<mpsc::Receiver<String>> {
        self.changes.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spoke_core::ports::Reading;

    fn bus() -> SimulatedBus {
        let mut bus = SimulatedBus::new();
        bus.initialize(&json!([
            {"id": "pump", "kind": "digital"},
            {"id": "temp", "kind": "analog", "value": 21.5},
        ]))
        .unwrap();
        bus
    }

    #[test]
    fn test_initialize_builds_declared_devices() {
        let bus = bus();

        assert_eq!(bus.device_ids(), vec!["pump".to_string(), "temp".to_string()]);
        assert_eq!(bus.device("pump").unwrap().kind(), DeviceKind::Digital);
        assert_eq!(bus.device("temp").unwrap().reading().unwrap(), Reading::Analog(21.5));
    }

    #[test]
    fn test_switching_reports_change_once() {
        // Arrange
        let mut bus = bus();
        let mut changes = bus.device_changes().unwrap();
        let pump = bus.device("pump").unwrap();
        let pump = pump.as_digital().unwrap();

        // Act
        pump.turn_on().unwrap();
        pump.turn_on().unwrap();
        pump.toggle().unwrap();

        // Assert
        assert_eq!(changes.try_recv().unwrap(), "pump");
        assert_eq!(changes.try_recv().unwrap(), "pump");
        assert!(changes.try_recv().is_err(), "repeated turn_on is not a change");
        assert!(!pump.status().unwrap());
    }

    #[test]
    fn test_unknown_and_uninitialised_lookups_fail() {
        let mut bus = bus();
        assert!(matches!(bus.device("fan"), Err(DeviceError::UnknownDevice(id)) if id == "fan"));

        bus.deinitialize();

        assert!(matches!(bus.device("pump"), Err(DeviceError::NotInitialized)));
        assert!(bus.device_ids().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut bus = SimulatedBus::new();
        let result = bus.initialize(&json!({"not": "a list"}));
        assert!(matches!(result, Err(DeviceError::Hardware(_))));
    }

    #[test]
    fn test_analog_handle_moves_reading() {
        let bus = bus();

        bus.analog("temp").unwrap().set_value(30.0);

        assert_eq!(bus.device("temp").unwrap().reading().unwrap(), Reading::Analog(30.0));
    }
}
