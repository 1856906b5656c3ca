//! Per-connection hub.
//!
//! A [`Controller`] owns an identity, an [`EventBus`], at most one active
//! [`Remote`], and the worker tasks supervising its handlers.  Everything a
//! handler does to the outside world goes through it: publishing, replying,
//! disconnecting and shutting down.
//!
//! # Topic rule
//!
//! A receiver that is the loopback sentinel (or this Controller's own id) is
//! local: the message is published on the topic of its command type and
//! never reaches the wire.  Any other receiver is a network peer: the message
//! goes to [`Topic::Outgoing`], which the Remote writer drains.
//!
//! # Shutdown
//!
//! [`Controller::shutdown`] runs once.  Later and concurrent callers wait for
//! that single run to finish.  It returns only after every handler worker has
//! left its loop and torn down, so a handler must never await it on its own
//! Controller; use [`Controller::shutdown_in_background`] instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bus::{EventBus, Topic};
use crate::protocol::{Command, CommandError, CommandType, Message};
use crate::runtime::remote::{ClosedSignal, Remote, RemoteConfig};
use crate::runtime::supervisor::{run_cycle, wait_for_shutdown, Handler, HandlerState};

/// Tunables for one Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub remote: RemoteConfig,
    /// Pause before re-running a handler whose Setup failed.
    pub setup_retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            setup_retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct Controller {
    id: Uuid,
    config: ControllerConfig,
    bus: Arc<EventBus<Message>>,
    remote: Mutex<Option<Remote>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_once: OnceCell<()>,
}

impl Controller {
    pub fn new(id: Uuid, config: ControllerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            config,
            bus: Arc::new(EventBus::new()),
            remote: Mutex::new(None),
            running: AtomicBool::new(true),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            shutdown_once: OnceCell::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus<Message>> {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns `true` when `id` addresses this end of the connection.
    pub fn is_local(&self, id: Uuid) -> bool {
        id.is_nil() || id == self.id
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Supervises `handler` on a dedicated task until shutdown.
    ///
    /// Whenever a run cycle returns while the Controller is still running it
    /// is started again straight away.  The one exception is a failed Setup,
    /// which waits [`ControllerConfig::setup_retry_delay`] first.
    pub fn start<H: Handler>(self: &Arc<Self>, mut handler: H) {
        if !self.is_running() {
            debug!(controller = %self.id, handler = handler.name(), "not starting handler after shutdown");
            return;
        }

        let controller = Arc::clone(self);
        let worker = tokio::spawn(async move {
            let mut shutdown = controller.shutdown_signal();
            while controller.is_running() {
                let state = run_cycle(&mut handler, &controller).await;
                if !controller.is_running() {
                    break;
                }
                if state == HandlerState::Created {
                    tokio::select! {
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(controller.config.setup_retry_delay) => {}
                    }
                } else {
                    tokio::task::yield_now().await;
                }
            }
            debug!(controller = %controller.id, handler = handler.name(), "handler worker exited");
        });
        self.lock_workers().push(worker);
    }

    // ── Connection ────────────────────────────────────────────────────────────

    /// Starts servicing `stream`, hard-terminating any previous Remote first.
    ///
    /// Returns a signal that fires when this particular Remote closes.
    pub fn connect<S>(&self, stream: S) -> ClosedSignal
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut slot = self.lock_remote();
        if let Some(previous) = slot.take() {
            debug!(controller = %self.id, "replacing active remote");
            previous.terminate();
        }
        let remote = Remote::spawn(stream, Arc::clone(&self.bus), self.config.remote, self.id);
        let closed = remote.closed();
        *slot = Some(remote);
        closed
    }

    /// Terminates the active Remote, if any.
    pub fn disconnect(&self) {
        if let Some(remote) = self.lock_remote().take() {
            remote.terminate();
        }
    }

    /// Returns `true` while a Remote is attached and still open.
    pub fn is_connected(&self) -> bool {
        self.lock_remote().as_ref().is_some_and(|r| !r.is_closed())
    }

    // ── Messaging ─────────────────────────────────────────────────────────────

    /// Publishes `command` addressed to `receiver`, choosing the topic by the
    /// loopback rule described in the module docs.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be encoded.
    pub async fn publish(&self, command: &Command, receiver: Uuid) -> Result<(), CommandError> {
        let msg = Message::from_command(self.id, receiver, command)?;
        let topic = if self.is_local(receiver) {
            Topic::Command(command.command_type)
        } else {
            Topic::Outgoing
        };
        self.bus.publish(msg, &[topic]).await;
        Ok(())
    }

    /// Publishes `command` on [`Topic::Outgoing`] whatever the receiver.
    ///
    /// Used before the peer id is known, e.g. for the first heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be encoded.
    pub async fn send(&self, command: &Command, receiver: Uuid) -> Result<(), CommandError> {
        let msg = Message::from_command(self.id, receiver, command)?;
        self.bus.publish(msg, &[Topic::Outgoing]).await;
        Ok(())
    }

    /// Replies to `request`'s sender with a `reply_type` command carrying
    /// `content`.  A reply to a local sender stays local.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if `content` cannot be serialised.
    pub async fn reply<T: Serialize>(
        &self,
        request: &Message,
        reply_type: CommandType,
        content: &T,
    ) -> Result<(), CommandError> {
        let command = Command::with_data(reply_type, content)?;
        let receiver = if self.is_local(request.sender) {
            Uuid::nil()
        } else {
            request.sender
        };
        self.publish(&command, receiver).await
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Stops everything this Controller runs and waits for its workers.
    pub async fn shutdown(&self) {
        self.shutdown_once
            .get_or_init(|| async {
                info!(controller = %self.id, "controller shutting down");
                self.disconnect();
                self.running.store(false, Ordering::SeqCst);
                self.shutdown_tx.send_replace(true);
                self.bus.shutdown();

                let workers = std::mem::take(&mut *self.lock_workers());
                for worker in workers {
                    if let Err(e) = worker.await {
                        error!(controller = %self.id, error = %e, "handler worker failed");
                    }
                }
                debug!(controller = %self.id, "controller shut down");
            })
            .await;
    }

    /// Runs [`shutdown`](Self::shutdown) on a separate task.
    pub fn shutdown_in_background(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.shutdown().await })
    }

    fn lock_remote(&self) -> MutexGuard<'_, Option<Remote>> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
