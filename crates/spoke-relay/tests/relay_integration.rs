//! End-to-end tests: real TCP sockets, a running [`RelayServer`], and plain
//! Controllers standing in for appliance nodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spoke_core::handlers::{DisconnectListener, Heartbeat};
use spoke_core::{Command, CommandType, Controller, ControllerConfig, RemoteConfig, Topic};
use spoke_relay::RelayServer;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn config() -> ControllerConfig {
    ControllerConfig {
        remote: RemoteConfig {
            max_idle_time: Duration::from_millis(600),
            write_timeout: Duration::from_millis(500),
        },
        setup_retry_delay: Duration::from_millis(20),
    }
}

struct Harness {
    server: Arc<RelayServer>,
    addr: std::net::SocketAddr,
    running: Arc<AtomicBool>,
}

impl Harness {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(Uuid::new_v4(), config());
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(Arc::clone(&server).run(listener, Arc::clone(&running)));
        Self { server, addr, running }
    }

    /// Dials the relay as a node and announces itself so the relay binds it.
    async fn node(&self) -> Arc<Controller> {
        let node = Controller::new(Uuid::new_v4(), config());
        node.start(Heartbeat::new(config().remote.max_idle_time));
        node.start(DisconnectListener::new());
        let stream = TcpStream::connect(self.addr).await.unwrap();
        node.connect(stream);
        node.send(&Command::heartbeat(), Uuid::nil()).await.unwrap();
        node
    }

    async fn wait_for_peers(&self, count: usize) {
        timeout(WAIT, async {
            while self.server.registry().len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} registered peers"));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn test_message_is_forwarded_between_nodes() {
    // Arrange
    let relay = Harness::start().await;
    let a = relay.node().await;
    let b = relay.node().await;
    relay.wait_for_peers(2).await;
    let mut inbox = b.bus().subscribe(&[Topic::Command(CommandType::DeviceCommand)]);

    // Act
    let command = Command::with_data(CommandType::DeviceCommand, &json!({"device": "pump", "action": "on"})).unwrap();
    a.send(&command, b.id()).await.unwrap();

    // Assert
    let received = timeout(WAIT, inbox.recv()).await.expect("forward timed out").unwrap();
    assert_eq!(received.sender, a.id());
    assert_eq!(received.receiver, b.id());
    assert_eq!(received.command().unwrap(), command);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_closed_connection_is_deregistered() {
    let relay = Harness::start().await;
    let a = relay.node().await;
    relay.wait_for_peers(1).await;

    a.shutdown().await;

    relay.wait_for_peers(0).await;
}

#[tokio::test]
async fn test_heartbeats_keep_nodes_registered() {
    let relay = Harness::start().await;
    let a = relay.node().await;
    relay.wait_for_peers(1).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(relay.server.registry().peers(), vec![a.id()]);
    assert!(a.is_connected());
    a.shutdown().await;
}

#[tokio::test]
async fn test_identity_switch_drops_the_connection() {
    // Arrange: a raw client that first speaks as one id, then as another
    let relay = Harness::start().await;
    let liar = Controller::new(Uuid::new_v4(), config());
    let stream = TcpStream::connect(relay.addr).await.unwrap();
    let closed = liar.connect(stream);
    liar.send(&Command::heartbeat(), Uuid::nil()).await.unwrap();
    relay.wait_for_peers(1).await;

    // Act: a second controller id on the same stream
    let forged = spoke_core::Message::from_command(Uuid::new_v4(), Uuid::nil(), &Command::heartbeat()).unwrap();
    liar.bus().publish(forged, &[Topic::Outgoing]).await;

    // Assert
    timeout(WAIT, closed.wait()).await.expect("relay must hang up on the liar");
    relay.wait_for_peers(0).await;
    liar.shutdown().await;
}

/// Sends `command` from `a` to `b`, then a device command that must still
/// arrive, proving `b`'s link outlived the first one.
async fn assert_link_survives(relay: &Harness, a: &Controller, b: &Controller, command: Command) {
    let mut inbox = b.bus().subscribe(&[Topic::Command(CommandType::DeviceCommand)]);
    let follow_up = Command::with_data(CommandType::DeviceCommand, &json!({"device": "pump", "action": "on"})).unwrap();

    a.send(&command, b.id()).await.unwrap();
    a.send(&follow_up, b.id()).await.unwrap();

    let received = timeout(WAIT, inbox.recv()).await.expect("follow-up never arrived").unwrap();
    assert_eq!(received.sender, a.id());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.is_running());
    assert!(b.is_connected());
    assert_eq!(relay.server.registry().len(), 2);
}

#[tokio::test]
async fn test_heartbeat_from_another_node_is_not_relayed() {
    // Arrange
    let relay = Harness::start().await;
    let a = relay.node().await;
    let b = relay.node().await;
    relay.wait_for_peers(2).await;

    // Act + Assert
    assert_link_survives(&relay, &a, &b, Command::heartbeat()).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_node_cannot_disconnect_another_node() {
    let relay = Harness::start().await;
    let a = relay.node().await;
    let b = relay.node().await;
    relay.wait_for_peers(2).await;

    assert_link_survives(&relay, &a, &b, Command::disconnect("kick")).await;

    a.shutdown().await;
    b.shutdown().await;
}
