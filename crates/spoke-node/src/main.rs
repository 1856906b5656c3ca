//! Spoke node entry point.
//!
//! ```text
//! main()
//!  └─ load NodeConfig (file, then CLI overrides; saved on first run)
//!  └─ open the state store, if configured
//!  └─ NodeClient::run  -- reconnect loop until Ctrl-C
//! ```
//!
//! Devices are driven by the [`SimulatedBus`] until a hardware driver for
//! the target board is wired in here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use spoke_core::ports::ConfigStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spoke_node::config::{default_config_path, load_config, save_config};
use spoke_node::{FileConfigStore, NodeClient, SimulatedBus};

#[derive(Debug, Parser)]
#[command(name = "spoke-node", version, about = "Spoke node: connects local devices to a relay")]
struct Args {
    /// Path to the TOML config file.  Defaults to the platform config directory.
    #[arg(short, long, env = "SPOKE_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Relay `host:port`, overriding the config file.
    #[arg(short, long, env = "SPOKE_NODE_RELAY")]
    relay: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = match args.config {
        Some(path) => path,
        None => default_config_path().context("resolving default config path")?,
    };
    let first_run = !path.exists();
    let mut config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    // The generated id must survive restarts, or the relay sees a new peer
    // every time.
    if first_run {
        match save_config(&config, &path) {
            Ok(()) => info!(config = %path.display(), "wrote initial config"),
            Err(e) => warn!(config = %path.display(), error = %e, "could not save initial config"),
        }
    }
    if let Some(relay) = args.relay {
        config.network.relay_address = relay;
    }

    info!(node = %config.node.id, relay = %config.network.relay_address, "Spoke node starting");

    let store = match &config.node.state_file {
        Some(state_file) => {
            let store = FileConfigStore::open(state_file)
                .with_context(|| format!("opening state file {}", state_file.display()))?;
            info!(path = %store.path().display(), "device states persisted");
            Some(Arc::new(store) as Arc<dyn ConfigStore>)
        }
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    let mut client = NodeClient::new(config, SimulatedBus::new)?;
    if let Some(store) = store {
        client = client.with_store(store);
    }
    Arc::new(client).run(running).await?;

    info!("Spoke node stopped");
    Ok(())
}
