//! Named status values and their aggregate snapshot.
//!
//! # How status flows (for beginners)
//!
//! Any subsystem that has state worth showing owns a [`StatusHolder`].
//! Changing the held value publishes a `status_update` command over loopback:
//!
//! ```text
//! StatusHolder::edit ──► status_update ──► StatusAggregator ──► StatusBoard
//!                                                   │
//!                                                   └──► status_snapshot to every subscriber
//! ```
//!
//! The [`StatusAggregator`] merges updates by name into a [`StatusBoard`] and
//! answers `status_subscribe` requests with the full snapshot.  A requester is
//! remembered and receives a fresh snapshot after every later update.
//!
//! One board may be shared by many Controllers (a relay gives every
//! connection the same one).  Each merge bumps the board's revision, and every
//! aggregator watching the board re-sends the snapshot to its own
//! subscribers, whichever connection the update came in on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::bus::Topic;
use crate::protocol::{Command, CommandError, CommandType, Message};
use crate::runtime::{Controller, Handler, HandlerError, Interrupts};

/// Body of a `status_update` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub name: String,
    pub value: Value,
}

/// Body of a `status_snapshot` command: every known value by name.
pub type StatusSnapshot = BTreeMap<String, Value>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── StatusHolder ──────────────────────────────────────────────────────────────

/// One named status value.
pub struct StatusHolder<T> {
    name: String,
    value: Mutex<T>,
}

impl<T: Clone + Serialize> StatusHolder<T> {
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            name: name.into(),
            value: Mutex::new(initial),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }

    /// Replaces the value and always publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the value cannot be serialised.
    pub async fn set(&self, value: T, controller: &Controller) -> Result<(), CommandError> {
        let update = {
            let mut current = lock(&self.value);
            *current = value;
            self.update_for(&current)?
        };
        self.announce(update, controller).await
    }

    /// Applies `transform` to the current value.  The result is stored and
    /// published only when `transform` reports a change.
    ///
    /// Returns whether a change was published.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the new value cannot be serialised.
    pub async fn edit<F>(&self, controller: &Controller, transform: F) -> Result<bool, CommandError>
    where
        F: FnOnce(&T) -> (T, bool),
    {
        let update = {
            let mut current = lock(&self.value);
            let (next, changed) = transform(&current);
            if !changed {
                return Ok(false);
            }
            *current = next;
            self.update_for(&current)?
        };
        self.announce(update, controller).await?;
        Ok(true)
    }

    fn update_for(&self, value: &T) -> Result<StatusUpdate, CommandError> {
        Ok(StatusUpdate {
            name: self.name.clone(),
            value: serde_json::to_value(value)?,
        })
    }

    async fn announce(&self, update: StatusUpdate, controller: &Controller) -> Result<(), CommandError> {
        trace!(controller = %controller.id(), status = %self.name, "status changed");
        let command = Command::with_data(CommandType::StatusUpdate, &update)?;
        controller.publish(&command, Uuid::nil()).await
    }
}

// ── StatusBoard ───────────────────────────────────────────────────────────────

/// Shared snapshot map, outliving individual connections.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    entries: Arc<Mutex<StatusSnapshot>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: Arc::default(),
            revision: Arc::new(revision),
        }
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name` and bumps the revision, even when the
    /// value is unchanged.  Returns `true` if the entry changed.
    pub fn merge(&self, name: &str, value: Value) -> bool {
        let changed = {
            let mut entries = lock(&self.entries);
            if entries.get(name) == Some(&value) {
                false
            } else {
                entries.insert(name.to_string(), value);
                true
            }
        };
        self.revision.send_modify(|revision| *revision += 1);
        changed
    }

    /// Number of merges so far.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// A receiver that wakes after every later merge.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.entries).get(name).cloned()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        lock(&self.entries).clone()
    }
}

// ── StatusAggregator ──────────────────────────────────────────────────────────

/// Merges `status_update`s into a [`StatusBoard`] and serves snapshots.
pub struct StatusAggregator {
    board: StatusBoard,
    subscribers: BTreeSet<Uuid>,
    watcher: Option<JoinHandle<()>>,
}

impl StatusAggregator {
    pub fn new(board: StatusBoard) -> Self {
        Self {
            board,
            subscribers: BTreeSet::new(),
            watcher: None,
        }
    }

    fn on_update(&self, message: &Message, command: &Command, controller: &Controller) -> Result<(), HandlerError> {
        let update: StatusUpdate = command.data_as()?;
        debug!(
            controller = %controller.id(),
            sender = %message.sender,
            status = %update.name,
            "status update"
        );
        // Subscribers are refreshed from the board's revision watch.
        self.board.merge(&update.name, update.value);
        Ok(())
    }

    async fn republish(&self, controller: &Controller) -> Result<(), HandlerError> {
        if self.subscribers.is_empty() {
            return Ok(());
        }
        let snapshot = Command::with_data(CommandType::StatusSnapshot, &self.board.snapshot())?;
        for subscriber in &self.subscribers {
            controller.publish(&snapshot, *subscriber).await?;
        }
        Ok(())
    }

    async fn on_subscribe(&mut self, message: &Message, controller: &Controller) -> Result<(), HandlerError> {
        let requester = if controller.is_local(message.sender) {
            Uuid::nil()
        } else {
            message.sender
        };
        if self.subscribers.insert(requester) {
            debug!(controller = %controller.id(), %requester, "status subscriber added");
        }
        controller
            .reply(message, CommandType::StatusSnapshot, &self.board.snapshot())
            .await?;
        Ok(())
    }
}

/// Forwards board revisions into the handler's side-channel.  Bursts of
/// merges collapse into one wake-up.
async fn watch_board(mut revisions: watch::Receiver<u64>, events: mpsc::Sender<u64>) {
    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    return;
                }
                let revision = *revisions.borrow_and_update();
                if events.send(revision).await.is_err() {
                    return;
                }
            }
            () = events.closed() => return,
        }
    }
}

#[async_trait]
impl Handler for StatusAggregator {
    /// Board revision after a merge.
    type Event = u64;

    fn name(&self) -> &'static str {
        "status"
    }

    fn topics(&self) -> Vec<Topic> {
        vec![
            Topic::Command(CommandType::StatusUpdate),
            Topic::Command(CommandType::StatusSubscribe),
        ]
    }

    async fn setup(&mut self, _controller: &Arc<Controller>) -> Result<Interrupts<u64>, HandlerError> {
        self.subscribers.clear();
        let (tx, rx) = mpsc::channel(1);
        self.watcher = Some(tokio::spawn(watch_board(self.board.watch(), tx)));
        Ok(Interrupts::none().with_events(rx))
    }

    async fn handle_message(&mut self, message: Message, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        let command = message.command()?;
        match command.command_type {
            CommandType::StatusUpdate => self.on_update(&message, &command, controller),
            CommandType::StatusSubscribe => self.on_subscribe(&message, controller).await,
            other => Err(HandlerError::Failed(format!("unexpected {other} command"))),
        }
    }

    async fn handle_event(&mut self, revision: u64, controller: &Arc<Controller>) -> Result<(), HandlerError> {
        trace!(controller = %controller.id(), revision, "status board changed");
        self.republish(controller).await
    }

    fn teardown(&mut self) {
        self.subscribers.clear();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
