//! # spoke-core
//!
//! Transport-agnostic core of the Spoke control plane: the wire format, the
//! in-process message bus, connection lifecycle and handler supervision.
//!
//! Both the relay and the appliance node build on this crate.  It never opens
//! a socket itself; anything implementing `AsyncRead + AsyncWrite` (a TCP
//! stream, a TLS stream, an in-memory duplex in tests) can be handed to a
//! [`Controller`].
//!
//! # Architecture overview (for beginners)
//!
//! Spoke is hub-and-spoke: small appliance nodes keep one long-lived stream
//! to a central relay, which can also forward messages between nodes.
//!
//! - **`protocol`** – How bytes travel.  A length-prefixed frame carries a
//!   sender id, a receiver id and a JSON command envelope.
//!
//! - **`bus`** – A bounded, topic-keyed publish/subscribe primitive.  Every
//!   connection has its own bus.
//!
//! - **`runtime`** – The [`Controller`] owns one connection (a [`Remote`]),
//!   one bus, and a set of [`Handler`]s, each supervised on its own task.
//!
//! - **`handlers`** – Handlers every connection runs: heartbeat, disconnect
//!   handling and status aggregation.
//!
//! - **`ports`** – Contracts for collaborators the core only consumes: a
//!   settings store and a device bus.
//!
//! Data flows like this:
//!
//! ```text
//! stream ─► Remote reader ─► bus topic ─► Handler ─► Controller::publish
//!                                                          │
//! stream ◄─ Remote writer ◄─ "outgoing" topic ◄────────────┘
//! ```

pub mod bus;
pub mod handlers;
pub mod ports;
pub mod protocol;
pub mod runtime;

pub use bus::{EventBus, Topic, BUS_CAPACITY};
pub use protocol::{Command, CommandError, CommandType, FrameError, Message};
pub use runtime::{
    ClosedSignal, Controller, ControllerConfig, Handler, HandlerError, HandlerState, Interrupts, Remote,
    RemoteConfig, Timer,
};
