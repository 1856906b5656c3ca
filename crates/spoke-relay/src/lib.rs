//! # spoke-relay
//!
//! The hub of a Spoke deployment.  Appliance nodes dial the relay and keep
//! one stream open; the relay keeps each link alive and forwards messages
//! addressed from one node to another.
//!
//! - **`registry`** – which Controller currently serves which peer id.
//! - **`router`** – the handler that binds peers and forwards between them.
//! - **`server`** – the TCP accept loop and per-connection wiring.
//! - **`config`** – TOML configuration.

pub mod config;
pub mod registry;
pub mod router;
pub mod server;

pub use registry::{PeerRegistry, RegistryError};
pub use router::Router;
pub use server::RelayServer;
