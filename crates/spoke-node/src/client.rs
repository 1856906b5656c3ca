//! Relay connection for an appliance node.
//!
//! [`NodeClient::run`] dials the relay, serves the connection until it
//! closes, waits `reconnect_interval` and dials again, for as long as the
//! running flag stays set.  Every connection gets a fresh Controller:
//!
//! ```text
//! NodeClient::run
//!  └─ connect ─► serve
//!                 ├─ Heartbeat
//!                 ├─ DisconnectListener
//!                 ├─ IoHandler         (device bus from the factory)
//!                 └─ StatusAggregator  (node status board)
//! ```
//!
//! The device bus is built anew per connection so that the handler's
//! Setup/Teardown pair brackets exactly one connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use spoke_core::handlers::{DisconnectListener, Heartbeat, StatusAggregator, StatusBoard};
use spoke_core::ports::{ConfigStore, DeviceBus};
use spoke_core::{Command, Controller};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::io::IoHandler;

/// How often a served connection re-checks the running flag.
const RUNNING_POLL: Duration = Duration::from_millis(200);

pub struct NodeClient<F> {
    config: NodeConfig,
    bus_config: Value,
    make_bus: F,
    store: Option<Arc<dyn ConfigStore>>,
    board: StatusBoard,
}

impl<F, B> NodeClient<F>
where
    F: Fn() -> B + Send + Sync + 'static,
    B: DeviceBus,
{
    /// # Errors
    ///
    /// Returns an error if the configured device list cannot be turned into
    /// the bus configuration.
    pub fn new(config: NodeConfig, make_bus: F) -> anyhow::Result<Self> {
        let bus_config = serde_json::to_value(&config.io.devices)?;
        Ok(Self {
            config,
            bus_config,
            make_bus,
            store: None,
            board: StatusBoard::new(),
        })
    }

    /// Persists device states in `store` across connections and restarts.
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> Uuid {
        self.config.node.id
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Keeps a connection to the relay until `running` is cleared.
    ///
    /// # Errors
    ///
    /// Currently never fails; dial errors are logged and retried.
    pub async fn run(self: Arc<Self>, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        let relay = self.config.network.relay_address.clone();
        let retry = self.config.reconnect_interval();

        while running.load(Ordering::Relaxed) {
            match TcpStream::connect(&relay).await {
                Ok(stream) => {
                    info!(node = %self.id(), %relay, "connected to relay");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "could not disable Nagle");
                    }
                    self.serve(stream, &running).await;
                    info!(node = %self.id(), "disconnected from relay; reconnecting in {retry:?}");
                }
                Err(e) => warn!(%relay, error = %e, "could not connect to relay"),
            }

            if running.load(Ordering::Relaxed) {
                time::sleep(retry).await;
            }
        }

        info!(node = %self.id(), "node client stopped");
        Ok(())
    }

    /// Runs one connection until the stream closes or `running` is cleared.
    pub async fn serve<S>(&self, stream: S, running: &AtomicBool)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let controller_config = self.config.controller_config();
        let controller = Controller::new(self.id(), controller_config);

        let mut io = IoHandler::new((self.make_bus)(), self.bus_config.clone(), self.config.poll_interval());
        if let Some(store) = &self.store {
            io = io.with_store(Arc::clone(store));
        }
        controller.start(Heartbeat::new(controller_config.remote.max_idle_time));
        controller.start(DisconnectListener::new());
        controller.start(io);
        controller.start(StatusAggregator::new(self.board.clone()));

        let closed = controller.connect(stream);
        // Announce ourselves so the relay can bind this connection right away.
        if let Err(e) = controller.send(&Command::heartbeat(), Uuid::nil()).await {
            warn!(error = %e, "could not send greeting");
        }

        loop {
            tokio::select! {
                _ = closed.wait() => break,
                _ = time::sleep(RUNNING_POLL) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        controller.shutdown().await;
    }
}
