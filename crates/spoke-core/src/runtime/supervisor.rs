//! Generic handler supervision.
//!
//! A [`Handler`] is a pluggable unit of behaviour.  It never touches the
//! network; it reacts to three kinds of input and talks back through its
//! [`Controller`]:
//!
//! | Input                      | Method                         |
//! |----------------------------|--------------------------------|
//! | a Message on its topics    | [`Handler::handle_message`]    |
//! | a timer tick               | [`Handler::handle_timer`]      |
//! | a side-channel event       | [`Handler::handle_event`]      |
//!
//! [`run_cycle`] drives one handler through
//! `Created → SetUp → Running → Terminated`:
//!
//! 1. `setup` runs.  On failure the cycle returns in `Created` and
//!    `teardown` is **not** called.
//! 2. The handler's topics are subscribed.
//! 3. Inputs are processed one at a time until shutdown is signalled or the
//!    message channel closes.  An error from any `handle_*` method is logged
//!    and the loop carries on.
//! 4. `teardown` runs exactly once on every exit from the loop, including a
//!    panic inside a `handle_*` method or the worker being dropped.

use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, warn};

use crate::bus::Topic;
use crate::ports::DeviceError;
use crate::protocol::{CommandError, Message};
use crate::runtime::controller::Controller;

/// Errors a handler may return.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler could not initialise.
    #[error("setup failed: {0}")]
    Setup(String),

    /// The peer broke an identity binding.  Connection-fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Any other failure while handling one input.
    #[error("{0}")]
    Failed(String),
}

/// Where a handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Created,
    SetUp,
    Running,
    Terminated,
}

/// Clock source requested by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Never fires.
    Never,
    /// Fires every period, first after one period.
    Periodic(Duration),
    /// Fires once, after the delay.
    Once(Duration),
}

/// Wake sources a handler asks for during Setup.
#[derive(Debug)]
pub struct Interrupts<E> {
    pub timer: Timer,
    pub events: Option<mpsc::Receiver<E>>,
}

impl<E> Interrupts<E> {
    /// No timer and no side-channel: the handler only reacts to messages.
    pub fn none() -> Self {
        Self {
            timer: Timer::Never,
            events: None,
        }
    }

    pub fn periodic(period: Duration) -> Self {
        Self {
            timer: Timer::Periodic(period),
            events: None,
        }
    }

    pub fn once(delay: Duration) -> Self {
        Self {
            timer: Timer::Once(delay),
            events: None,
        }
    }

    /// Adds a side-channel of opaque events.
    pub fn with_events(mut self, events: mpsc::Receiver<E>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Capability interface implemented by every handler.
#[async_trait]
pub trait Handler: Send + 'static {
    /// Side-channel event type.  Use [`std::convert::Infallible`] when the
    /// handler has none.
    type Event: Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Bus topics whose Messages this handler wants.
    fn topics(&self) -> Vec<Topic>;

    /// Prepares the handler for one run cycle.
    ///
    /// # Errors
    ///
    /// Any error ends the cycle without a Teardown call.
    async fn setup(&mut self, controller: &Arc<Controller>) -> Result<Interrupts<Self::Event>, HandlerError>;

    async fn handle_message(&mut self, message: Message, controller: &Arc<Controller>) -> Result<(), HandlerError>;

    async fn handle_timer(&mut self, _tick: Instant, _controller: &Arc<Controller>) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn handle_event(&mut self, _event: Self::Event, _controller: &Arc<Controller>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Releases whatever Setup acquired.  Called exactly once per successful
    /// Setup.
    fn teardown(&mut self);
}

/// Runs one full lifecycle of `handler` and returns the state it ended in:
/// [`HandlerState::Created`] when Setup failed, [`HandlerState::Terminated`]
/// otherwise.
pub async fn run_cycle<H: Handler>(handler: &mut H, controller: &Arc<Controller>) -> HandlerState {
    let name = handler.name();

    let interrupts = match handler.setup(controller).await {
        Ok(interrupts) => interrupts,
        Err(e) => {
            error!(controller = %controller.id(), handler = name, error = %e, "handler setup failed");
            return HandlerState::Created;
        }
    };
    let mut state = HandlerState::SetUp;
    debug!(controller = %controller.id(), handler = name, ?state, "handler ready");

    let mut handler = TeardownGuard { handler };
    let mut messages = controller.bus().subscribe(&handler.topics());
    let mut shutdown = controller.shutdown_signal();
    let Interrupts { timer, mut events } = interrupts;
    let mut ticker = Ticker::new(timer);

    state = HandlerState::Running;
    debug!(controller = %controller.id(), handler = name, ?state, "handler running");

    loop {
        let outcome = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            tick = ticker.tick() => handler.handle_timer(tick, controller).await,
            event = next_event(&mut events) => match event {
                Some(event) => handler.handle_event(event, controller).await,
                None => {
                    debug!(controller = %controller.id(), handler = name, "side-channel closed");
                    events = None;
                    Ok(())
                }
            },
            message = messages.recv() => match message {
                Some(message) => handler.handle_message(message, controller).await,
                None => break,
            },
        };

        match outcome {
            Ok(()) => {}
            Err(e @ HandlerError::ProtocolViolation(_)) => {
                error!(controller = %controller.id(), handler = name, error = %e, "protocol violation");
            }
            Err(e) => {
                warn!(controller = %controller.id(), handler = name, error = %e, "handler error");
            }
        }
    }

    drop(handler);
    state = HandlerState::Terminated;
    debug!(controller = %controller.id(), handler = name, ?state, "handler torn down");
    state
}

/// Resolves once `shutdown` reads `true`, or once its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// ── Internals ─────────────────────────────────────────────────────────────────

/// Calls `teardown` when dropped, so every exit path runs it.
struct TeardownGuard<'a, H: Handler> {
    handler: &'a mut H,
}

impl<H: Handler> Deref for TeardownGuard<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.handler
    }
}

impl<H: Handler> DerefMut for TeardownGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.handler
    }
}

impl<H: Handler> Drop for TeardownGuard<'_, H> {
    fn drop(&mut self) {
        self.handler.teardown();
    }
}

enum Ticker {
    Never,
    Periodic(Interval),
    Once(Option<Pin<Box<Sleep>>>),
}

impl Ticker {
    fn new(timer: Timer) -> Self {
        match timer {
            Timer::Never => Ticker::Never,
            Timer::Periodic(period) => {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Ticker::Periodic(interval)
            }
            Timer::Once(delay) => Ticker::Once(Some(Box::pin(tokio::time::sleep(delay)))),
        }
    }

    async fn tick(&mut self) -> Instant {
        match self {
            Ticker::Never => std::future::pending().await,
            Ticker::Periodic(interval) => interval.tick().await,
            Ticker::Once(slot) => match slot.as_mut() {
                Some(sleep) => {
                    sleep.as_mut().await;
                    let deadline = sleep.deadline();
                    *slot = None;
                    deadline
                }
                None => std::future::pending().await,
            },
        }
    }
}

async fn next_event<E>(events: &mut Option<mpsc::Receiver<E>>) -> Option<E> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
