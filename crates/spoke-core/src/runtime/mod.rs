//! Connection lifecycle and handler supervision.

pub mod controller;
pub mod remote;
pub mod supervisor;

pub use controller::{Controller, ControllerConfig};
pub use remote::{ClosedSignal, Remote, RemoteConfig};
pub use supervisor::{run_cycle, Handler, HandlerError, HandlerState, Interrupts, Timer};
