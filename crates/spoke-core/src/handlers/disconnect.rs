//! Turns disconnect requests into an actual disconnect.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::bus::Topic;
use crate::protocol::{CommandType, DisconnectRequest, Message};
use crate::runtime::{Controller, Handler, HandlerError, Interrupts};

/// Drops the active Remote whenever a disconnect request arrives, whether it
/// came over loopback (e.g. from [`Heartbeat`](super::Heartbeat)) or from the
/// peer.
#[derive(Debug, Default)]
pub struct DisconnectListener;

impl DisconnectListener {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for DisconnectListener {
    type Event = Infallible;

    fn name(&self) -> &'static str {
        "disconnect"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::Command(CommandType::Disconnect)]
    }

    async fn setup(&mut self, _controller: &Arc<Controller>) -> Result<Interrupts<Infallible>, HandlerError> {
        Ok(Interrupts::none())
    }

    async fn handle_message(&mut self, message: Message, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        // A request without a readable reason still disconnects.
        let reason = message
            .command()
            .ok()
            .and_then(|command| command.data_as::<DisconnectRequest>().ok())
            .map(|request| request.reason)
            .unwrap_or_default();

        if controller.is_local(message.sender) {
            info!(controller = %controller.id(), %reason, "disconnecting on local request");
        } else {
            info!(controller = %controller.id(), peer = %message.sender, %reason, "peer asked to disconnect");
        }
        controller.disconnect();
        Ok(())
    }

    fn teardown(&mut self) {}
}
