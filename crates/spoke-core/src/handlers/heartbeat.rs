//! Liveness enforcement.
//!
//! Both ends of a connection run a [`Heartbeat`].  Every tick it sends a
//! heartbeat to the peer and counts a miss; every heartbeat received from the
//! peer resets the count.  When the count reaches the threshold it asks its
//! own Controller, over loopback, to drop the connection.
//!
//! This catches half-open streams: a peer that vanished without a FIN can
//! keep a TCP connection looking healthy for a long time, while the miss
//! counter notices within `threshold × interval`.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::Topic;
use crate::protocol::{Command, CommandType, Message};
use crate::runtime::{Controller, Handler, HandlerError, Interrupts};

/// Consecutive unanswered ticks tolerated before disconnecting.
pub const MISS_THRESHOLD: u32 = 3;

/// Ticks per idle period.
const TICKS_PER_IDLE: u32 = 3;

pub struct Heartbeat {
    interval: Duration,
    threshold: u32,
    peer: Option<Uuid>,
    misses: Arc<AtomicU32>,
    disconnect_requested: bool,
}

impl Heartbeat {
    /// Creates a heartbeat ticking three times per `max_idle_time`, so the
    /// peer's idle deadline never expires while both ends are healthy.
    pub fn new(max_idle_time: Duration) -> Self {
        Self {
            interval: max_idle_time / TICKS_PER_IDLE,
            threshold: MISS_THRESHOLD,
            peer: None,
            misses: Arc::new(AtomicU32::new(0)),
            disconnect_requested: false,
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Shared view of the miss counter.
    pub fn miss_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.misses)
    }
}

#[async_trait]
impl Handler for Heartbeat {
    type Event = Infallible;

    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::Command(CommandType::Heartbeat)]
    }

    async fn setup(&mut self, _controller: &Arc<Controller>) -> Result<Interrupts<Infallible>, HandlerError> {
        self.misses.store(0, Ordering::SeqCst);
        self.disconnect_requested = false;
        Ok(Interrupts::periodic(self.interval))
    }

    async fn handle_message(&mut self, message: Message, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        if message.sender == controller.id() {
            return Ok(());
        }

        match self.peer {
            None => {
                debug!(controller = %controller.id(), peer = %message.sender, "heartbeat peer bound");
                self.peer = Some(message.sender);
            }
            Some(peer) if peer == message.sender => {}
            Some(peer) => {
                controller.shutdown_in_background();
                return Err(HandlerError::ProtocolViolation(format!(
                    "heartbeat from {} on a connection bound to {peer}",
                    message.sender
                )));
            }
        }

        self.misses.store(0, Ordering::SeqCst);
        self.disconnect_requested = false;
        Ok(())
    }

    async fn handle_timer(&mut self, _tick: Instant, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        let receiver = self.peer.unwrap_or_else(Uuid::nil);
        controller.send(&Command::heartbeat(), receiver).await?;

        let misses = self.misses.fetch_add(1, Ordering::SeqCst) + 1;
        if misses >= self.threshold && !self.disconnect_requested {
            self.disconnect_requested = true;
            warn!(controller = %controller.id(), misses, "peer stopped answering heartbeats");
            let reason = format!("{misses} heartbeats unanswered");
            controller.publish(&Command::disconnect(reason), Uuid::nil()).await?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        debug!(misses = self.misses.load(Ordering::SeqCst), "heartbeat stopped");
    }
}
