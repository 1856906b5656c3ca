//! Handler that exposes a [`DeviceBus`] over the control plane.
//!
//! - Setup brings the bus up, restores persisted digital states and asks for
//!   a poll timer plus the bus's change channel.
//! - `device_command` messages switch digital devices and `device_reading`
//!   messages read any device; the requester gets an `ack` with the reading
//!   or an `error` with the reason.
//! - Polls and change notifications refresh a [`StatusHolder`] of readings,
//!   which announces itself only when a reading actually moved.
//! - Teardown releases the bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use spoke_core::handlers::StatusHolder;
use spoke_core::ports::{ConfigStore, ConfigStoreExt, DeviceBus, DeviceError, Reading};
use spoke_core::{CommandType, Controller, Handler, HandlerError, Interrupts, Message, Topic};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{DeviceAck, DeviceAction, DeviceCommandRequest, DeviceFailure, DeviceReadingRequest};

/// Name under which readings appear in the status snapshot.
pub const READINGS_STATUS: &str = "io";

/// Store key holding the last commanded digital states.
pub const STATES_KEY: &str = "io.digital_states";

pub type Readings = BTreeMap<String, Reading>;

pub struct IoHandler<B: DeviceBus> {
    bus: B,
    bus_config: Value,
    poll_interval: Duration,
    readings: Arc<StatusHolder<Readings>>,
    store: Option<Arc<dyn ConfigStore>>,
}

impl<B: DeviceBus> IoHandler<B> {
    pub fn new(bus: B, bus_config: Value, poll_interval: Duration) -> Self {
        Self {
            bus,
            bus_config,
            poll_interval,
            readings: Arc::new(StatusHolder::new(READINGS_STATUS, Readings::new())),
            store: None,
        }
    }

    /// Persists commanded states in `store` and restores them on Setup.
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shared view of the latest readings.
    pub fn readings(&self) -> Arc<StatusHolder<Readings>> {
        Arc::clone(&self.readings)
    }

    fn restore_states(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let states: BTreeMap<String, bool> = match store.get_struct(STATES_KEY) {
            Ok(Some(states)) => states,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable persisted device states");
                return;
            }
        };
        for (id, on) in states {
            let restored = self.bus.device(&id).and_then(|device| {
                let digital = device.as_digital()?;
                if on {
                    digital.turn_on()
                } else {
                    digital.turn_off()
                }
            });
            if let Err(e) = restored {
                warn!(device = %id, error = %e, "could not restore device state");
            }
        }
    }

    fn persist_state(&self, device: &str, on: bool) {
        let Some(store) = &self.store else {
            return;
        };
        let mut states: BTreeMap<String, bool> =
            store.get_struct(STATES_KEY).ok().flatten().unwrap_or_default();
        states.insert(device.to_string(), on);
        if let Err(e) = store.set_struct(STATES_KEY, &states).and_then(|()| store.sync()) {
            warn!(device, error = %e, "could not persist device state");
        }
    }

    fn apply(&self, request: &DeviceCommandRequest) -> Result<Reading, DeviceError> {
        let device = self.bus.device(&request.device)?;
        let digital = device.as_digital()?;
        match request.action {
            DeviceAction::On => digital.turn_on()?,
            DeviceAction::Off => digital.turn_off()?,
            DeviceAction::Toggle => digital.toggle()?,
        }
        device.reading()
    }

    /// Passes `result` through, releasing the bus first if it is an error.
    /// Teardown only follows a successful Setup, so a Setup step that fails
    /// after the bus came up must release it here.
    fn release_on_error<T>(&mut self, result: Result<T, HandlerError>) -> Result<T, HandlerError> {
        if let Err(e) = &result {
            warn!(error = %e, "setup failed after the device bus came up; releasing it");
            self.bus.deinitialize();
        }
        result
    }

    /// Reads `ids`, skipping devices whose read fails.
    fn read(&self, ids: Vec<String>) -> Readings {
        let mut fresh = Readings::new();
        for id in ids {
            match self.bus.device(&id).and_then(|device| device.reading()) {
                Ok(reading) => {
                    fresh.insert(id, reading);
                }
                Err(e) => warn!(device = %id, error = %e, "reading failed"),
            }
        }
        fresh
    }
}

/// Merges `fresh` into `holder`; the holder announces only real changes.
async fn merge_readings(
    holder: &StatusHolder<Readings>,
    fresh: Readings,
    controller: &Controller,
) -> Result<(), HandlerError> {
    if fresh.is_empty() {
        return Ok(());
    }
    let changed = holder
        .edit(controller, move |current| {
            let mut next = current.clone();
            next.extend(fresh);
            let changed = next != *current;
            (next, changed)
        })
        .await?;
    if changed {
        debug!(controller = %controller.id(), "device readings changed");
    }
    Ok(())
}

#[async_trait]
impl<B: DeviceBus> Handler for IoHandler<B> {
    /// Id of a device whose state changed.
    type Event = String;

    fn name(&self) -> &'static str {
        "io"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![
            Topic::Command(CommandType::DeviceCommand),
            Topic::Command(CommandType::DeviceReading),
        ]
    }

    async fn setup(&mut self, controller: &Arc<Controller>) -> Result<Interrupts<String>, HandlerError> {
        self.bus
            .initialize(&self.bus_config)
            .map_err(|e| HandlerError::Setup(format!("device bus: {e}")))?;
        self.restore_states();

        let ids = self.bus.device_ids();
        info!(controller = %controller.id(), devices = ids.len(), "device bus ready");
        let fresh = self.read(ids);
        let merged = merge_readings(&self.readings, fresh, controller).await;
        self.release_on_error(merged)?;

        let interrupts = Interrupts::periodic(self.poll_interval);
        Ok(match self.bus.device_changes() {
            Some(changes) => interrupts.with_events(changes),
            None => interrupts,
        })
    }

    async fn handle_message(&mut self, message: Message, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        let command = message.command()?;
        let (device, outcome) = match command.command_type {
            CommandType::DeviceReading => {
                let request: DeviceReadingRequest = command.data_as()?;
                let outcome = self.bus.device(&request.device).and_then(|device| device.reading());
                (request.device, outcome)
            }
            _ => {
                let request: DeviceCommandRequest = command.data_as()?;
                let outcome = self.apply(&request);
                if let Ok(reading) = &outcome {
                    info!(controller = %controller.id(), device = %request.device, action = ?request.action, ?reading, "device switched");
                    if let Reading::Digital(on) = reading {
                        self.persist_state(&request.device, *on);
                    }
                }
                (request.device, outcome)
            }
        };

        match outcome {
            Ok(reading) => {
                let ack = DeviceAck {
                    device: device.clone(),
                    reading,
                };
                controller.reply(&message, CommandType::Ack, &ack).await?;
                let fresh = self.read(vec![device]);
                merge_readings(&self.readings, fresh, controller).await
            }
            Err(e) => {
                let failure = DeviceFailure {
                    device,
                    message: e.to_string(),
                };
                controller.reply(&message, CommandType::Error, &failure).await?;
                Err(e.into())
            }
        }
    }

    async fn handle_timer(&mut self, _tick: Instant, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        let fresh = self.read(self.bus.device_ids());
        merge_readings(&self.readings, fresh, controller).await
    }

    async fn handle_event(&mut self, device: String, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        let fresh = self.read(vec![device]);
        merge_readings(&self.readings, fresh, controller).await
    }

    fn teardown(&mut self) {
        self.bus.deinitialize();
        debug!("device bus released");
    }
}
