//! Accept loop and per-connection wiring.
//!
//! Each accepted stream gets a fresh Controller running the relay's handler
//! set:
//!
//! ```text
//! RelayServer::run
//!  └─ accept ─► serve_connection
//!                ├─ Router            (forwarding, peer registry)
//!                ├─ Heartbeat         (liveness)
//!                ├─ DisconnectListener
//!                └─ StatusAggregator  (relay-wide status board)
//! ```
//!
//! TLS termination happens before a stream reaches this module; the relay
//! only sees an already-secured byte stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spoke_core::handlers::{DisconnectListener, Heartbeat, StatusAggregator, StatusBoard};
use spoke_core::{Controller, ControllerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::PeerRegistry;
use crate::router::Router;

/// How often the accept loop re-checks the running flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

pub struct RelayServer {
    id: Uuid,
    config: ControllerConfig,
    registry: Arc<PeerRegistry>,
    board: StatusBoard,
}

impl RelayServer {
    pub fn new(id: Uuid, config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            registry: Arc::new(PeerRegistry::new()),
            board: StatusBoard::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Accepts connections until `running` is cleared.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and the loop carries
    /// on.
    pub async fn run(self: Arc<Self>, listener: TcpListener, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(relay = %self.id, %addr, "relay listening");
        }

        while running.load(Ordering::Relaxed) {
            let (stream, addr) = match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, error = %e, "could not disable Nagle");
            }
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.serve_connection(stream, addr).await });
        }

        info!(relay = %self.id, "relay stopped accepting");
        Ok(())
    }

    /// Runs one connection to completion: wires a Controller, waits for the
    /// stream to close, then shuts the Controller down.
    pub async fn serve_connection<S>(&self, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let controller = Controller::new(self.id, self.config);
        controller.start(Router::new(Arc::clone(&self.registry)));
        controller.start(Heartbeat::new(self.config.remote.max_idle_time));
        controller.start(DisconnectListener::new());
        controller.start(StatusAggregator::new(self.board.clone()));

        let closed = controller.connect(stream);
        info!(%addr, peers = self.registry.len(), "connection accepted");

        closed.wait().await;
        controller.shutdown().await;
        info!(%addr, peers = self.registry.len(), "connection closed");
    }
}
