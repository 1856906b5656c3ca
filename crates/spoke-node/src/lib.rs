//! # spoke-node
//!
//! An appliance node.  It keeps one connection open to the relay, answers
//! heartbeats, exposes its local devices to peers and publishes their
//! readings as status.
//!
//! - **`client`** – the reconnect loop and per-connection wiring.
//! - **`io`** – the device handler, its wire payloads and a simulated bus.
//! - **`store`** – a TOML file that remembers commanded device states.
//! - **`config`** – TOML configuration.

pub mod client;
pub mod config;
pub mod io;
pub mod store;

pub use client::NodeClient;
pub use io::{IoHandler, SimulatedBus};
pub use store::FileConfigStore;
