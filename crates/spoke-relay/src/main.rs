//! Spoke relay entry point.
//!
//! ```text
//! main()
//!  └─ load RelayConfig (file, then CLI overrides)
//!  └─ bind TcpListener
//!  └─ RelayServer::run  -- until Ctrl-C
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spoke_relay::config::{default_config_path, load_config};
use spoke_relay::RelayServer;

#[derive(Debug, Parser)]
#[command(name = "spoke-relay", version, about = "Spoke relay: forwards messages between connected appliances")]
struct Args {
    /// Path to the TOML config file.  Defaults to the platform config directory.
    #[arg(short, long, env = "SPOKE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overriding the config file.
    #[arg(long, env = "SPOKE_RELAY_BIND")]
    bind: Option<String>,

    /// Port to listen on, overriding the config file.
    #[arg(short, long, env = "SPOKE_RELAY_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = match args.config {
        Some(path) => path,
        None => default_config_path().context("resolving default config path")?,
    };
    let mut config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(bind) = args.bind {
        config.network.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.relay.log_level)),
        )
        .init();

    info!(config = %path.display(), "Spoke relay starting");

    let address = config.listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    let server = RelayServer::new(config.relay.id, config.controller_config());
    server.run(listener, running).await?;

    info!("Spoke relay stopped");
    Ok(())
}
