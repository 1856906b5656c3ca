//! Cross-connection forwarding.
//!
//! Every relay-side Controller runs one [`Router`].  The Router watches all
//! traffic its connection receives and:
//!
//! 1. binds the sender of the first message as the connection's peer and
//!    registers the Controller under that id;
//! 2. treats any later message from a different sender as a protocol
//!    violation, which shuts the connection down;
//! 3. forwards messages addressed to another peer onto that peer's outgoing
//!    topic.
//!
//! Heartbeats and disconnect requests belong to a single link and are never
//! forwarded; a peer cannot use the relay to kick or confuse another peer.
//! Forwarding is best-effort.  A target that is not connected right now, or
//! whose outgoing buffer is full, simply does not get the message.

use std::convert::Infallible;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use spoke_core::{Controller, Handler, HandlerError, Interrupts, Message, Topic};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::PeerRegistry;

pub struct Router {
    registry: Arc<PeerRegistry>,
    peer: Option<Uuid>,
    owner: Weak<Controller>,
}

impl Router {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self {
            registry,
            peer: None,
            owner: Weak::new(),
        }
    }

    /// The peer this connection is bound to, once known.
    pub fn peer(&self) -> Option<Uuid> {
        self.peer
    }

    fn bind(&mut self, sender: Uuid, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        if let Err(e) = self.registry.register(sender, controller) {
            controller.shutdown_in_background();
            return Err(HandlerError::ProtocolViolation(e.to_string()));
        }
        info!(controller = %controller.id(), peer = %sender, "peer registered");
        self.peer = Some(sender);
        Ok(())
    }

    fn forward(&self, message: Message, controller: &Controller) {
        let receiver = message.receiver;
        match message.command() {
            Ok(command) if command.command_type.is_link_scoped() => {
                warn!(
                    controller = %controller.id(),
                    sender = %message.sender,
                    %receiver,
                    command = %command.command_type,
                    "link-scoped command addressed to another peer; dropped"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(controller = %controller.id(), %receiver, error = %e, "unreadable command; not forwarded");
                return;
            }
        }
        match self.registry.lookup(receiver) {
            Some(target) => {
                if target.bus().try_publish(message, &[Topic::Outgoing]) == 0 {
                    warn!(controller = %controller.id(), %receiver, "forward dropped: target not accepting");
                }
            }
            None => debug!(controller = %controller.id(), %receiver, "no route to peer; message dropped"),
        }
    }
}

#[async_trait]
impl Handler for Router {
    type Event = Infallible;

    fn name(&self) -> &'static str {
        "router"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::Incoming]
    }

    async fn setup(&mut self, controller: &Arc<Controller>) -> Result<Interrupts<Infallible>, HandlerError> {
        self.owner = Arc::downgrade(controller);
        Ok(Interrupts::none())
    }

    async fn handle_message(&mut self, message: Message, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        match self.peer {
            None => self.bind(message.sender, controller)?,
            Some(peer) if peer == message.sender => {}
            Some(peer) => {
                self.registry.remove_if_owner(peer, controller);
                controller.shutdown_in_background();
                return Err(HandlerError::ProtocolViolation(format!(
                    "message from {} on a connection bound to {peer}",
                    message.sender
                )));
            }
        }

        if !controller.is_local(message.receiver) {
            self.forward(message, controller);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        let Some(peer) = self.peer.take() else {
            return;
        };
        if let Some(owner) = self.owner.upgrade() {
            if self.registry.remove_if_owner(peer, &owner) {
                info!(controller = %owner.id(), %peer, "peer deregistered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoke_core::{Command, CommandType, ControllerConfig};
    use std::time::Duration;
    use tokio::time::timeout;

    fn controller() -> Arc<Controller> {
        Controller::new(Uuid::new_v4(), ControllerConfig::default())
    }

    fn message(sender: Uuid, receiver: Uuid) -> Message {
        Message::from_command(sender, receiver, &Command::new(CommandType::DeviceCommand)).unwrap()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !done() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_first_message_binds_peer() {
        // Arrange
        let registry = Arc::new(PeerRegistry::new());
        let controller = controller();
        let mut router = Router::new(Arc::clone(&registry));
        router.setup(&controller).await.unwrap();
        let peer = Uuid::new_v4();

        // Act
        router.handle_message(message(peer, Uuid::nil()), &controller).await.unwrap();

        // Assert
        assert_eq!(router.peer(), Some(peer));
        assert!(Arc::ptr_eq(&registry.lookup(peer).unwrap(), &controller));
    }

    #[tokio::test]
    async fn test_forwards_to_registered_peer_within_deadline() {
        // Arrange: two connections, each bound to its own peer
        let registry = Arc::new(PeerRegistry::new());
        let a = controller();
        let b = controller();
        let (peer_a, peer_b) = (Uuid::new_v4(), Uuid::new_v4());
        a.start(Router::new(Arc::clone(&registry)));
        b.start(Router::new(Arc::clone(&registry)));
        wait_until(|| a.bus().subscriber_count() == 1 && b.bus().subscriber_count() == 1).await;
        let mut b_outgoing = b.bus().subscribe(&[Topic::Outgoing]);
        b.bus().publish(message(peer_b, Uuid::nil()), &[Topic::Incoming]).await;
        wait_until(|| registry.len() == 1).await;

        // Act: peer A addresses peer B
        a.bus().publish(message(peer_a, peer_b), &[Topic::Incoming]).await;

        // Assert
        let forwarded = timeout(Duration::from_millis(200), b_outgoing.recv())
            .await
            .expect("forward must arrive within 200 ms")
            .unwrap();
        assert_eq!(forwarded.sender, peer_a);
        assert_eq!(forwarded.receiver, peer_b);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_scoped_commands_are_not_forwarded() {
        // Arrange
        let registry = Arc::new(PeerRegistry::new());
        let a = controller();
        let b = controller();
        let (peer_a, peer_b) = (Uuid::new_v4(), Uuid::new_v4());
        a.start(Router::new(Arc::clone(&registry)));
        b.start(Router::new(Arc::clone(&registry)));
        wait_until(|| a.bus().subscriber_count() == 1 && b.bus().subscriber_count() == 1).await;
        let mut b_outgoing = b.bus().subscribe(&[Topic::Outgoing]);
        b.bus().publish(message(peer_b, Uuid::nil()), &[Topic::Incoming]).await;
        wait_until(|| registry.len() == 1).await;

        // Act
        for command in [Command::heartbeat(), Command::disconnect("kick")] {
            let msg = Message::from_command(peer_a, peer_b, &command).unwrap();
            a.bus().publish(msg, &[Topic::Incoming]).await;
        }
        a.bus().publish(message(peer_a, peer_b), &[Topic::Incoming]).await;

        // Assert: only the device command made it across
        let forwarded = timeout(Duration::from_millis(200), b_outgoing.recv())
            .await
            .expect("device command must be forwarded")
            .unwrap();
        assert_eq!(forwarded.command().unwrap().command_type, CommandType::DeviceCommand);
        assert!(b_outgoing.try_recv().is_err());
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_receiver_is_dropped() {
        let registry = Arc::new(PeerRegistry::new());
        let controller = controller();
        let mut router = Router::new(Arc::clone(&registry));
        router.setup(&controller).await.unwrap();

        let result = router
            .handle_message(message(Uuid::new_v4(), Uuid::new_v4()), &controller)
            .await;

        assert!(result.is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_mismatch_shuts_down_and_deregisters() {
        // Arrange
        let registry = Arc::new(PeerRegistry::new());
        let controller = controller();
        let mut router = Router::new(Arc::clone(&registry));
        router.setup(&controller).await.unwrap();
        let peer = Uuid::new_v4();
        router.handle_message(message(peer, Uuid::nil()), &controller).await.unwrap();

        // Act
        let result = router
            .handle_message(message(Uuid::new_v4(), Uuid::nil()), &controller)
            .await;

        // Assert
        assert!(matches!(result, Err(HandlerError::ProtocolViolation(_))));
        assert!(registry.lookup(peer).is_none());
        wait_until(|| !controller.is_running()).await;
    }

    #[tokio::test]
    async fn test_teardown_removes_own_entry() {
        let registry = Arc::new(PeerRegistry::new());
        let controller = controller();
        let mut router = Router::new(Arc::clone(&registry));
        router.setup(&controller).await.unwrap();
        router.handle_message(message(Uuid::new_v4(), Uuid::nil()), &controller).await.unwrap();

        router.teardown();

        assert!(registry.is_empty());
        assert_eq!(router.peer(), None);
    }

    #[tokio::test]
    async fn test_duplicate_live_peer_is_rejected() {
        let registry = Arc::new(PeerRegistry::new());
        let first = controller();
        let second = controller();
        let peer = Uuid::new_v4();
        registry.register(peer, &first).unwrap();
        let mut router = Router::new(Arc::clone(&registry));
        router.setup(&second).await.unwrap();

        let result = router.handle_message(message(peer, Uuid::nil()), &second).await;

        assert!(matches!(result, Err(HandlerError::ProtocolViolation(_))));
        assert!(Arc::ptr_eq(&registry.lookup(peer).unwrap(), &first));
    }
}
