//! Handlers shipped with the core.
//!
//! Each one is a [`Handler`](crate::runtime::Handler) meant to run on every
//! Controller regardless of role.  Role-specific handlers (routing, device
//! I/O) live in the relay and node crates.

pub mod disconnect;
pub mod heartbeat;
pub mod status;

pub use disconnect::DisconnectListener;
pub use heartbeat::{Heartbeat, MISS_THRESHOLD};
pub use status::{StatusAggregator, StatusBoard, StatusHolder, StatusSnapshot, StatusUpdate};
