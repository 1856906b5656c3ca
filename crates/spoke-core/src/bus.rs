//! Topic-addressed publish/subscribe over bounded channels.
//!
//! Every Controller owns one [`EventBus`].  The Remote reader publishes what
//! arrives from the wire, handlers publish replies and notifications, and the
//! Remote writer drains the [`Topic::Outgoing`] topic back onto the wire.
//!
//! # Two publish paths
//!
//! - [`EventBus::publish`] waits for room in every matching subscriber's
//!   buffer.  A saturated subscriber therefore slows the publisher down
//!   (back-pressure).  Internal delivery uses this path.
//! - [`EventBus::try_publish`] never waits.  A subscriber whose buffer is full
//!   simply misses the value.  Best-effort broadcast uses this path so that
//!   one slow consumer cannot stall everyone else.
//!
//! Both paths are kept on purpose; they are not interchangeable.
//!
//! # Ordering
//!
//! Values reach a single subscriber in publish order.  Nothing is promised
//! across subscribers or across topics.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::protocol::CommandType;

/// Buffer size of every subscriber channel.
pub const BUS_CAPACITY: usize = 16;

/// Key identifying a class of deliverable values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Messages that must leave over the wire.
    Outgoing,
    /// Every message the Remote reader decoded from the wire.
    Incoming,
    /// Messages of one command type.
    Command(CommandType),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Outgoing => f.write_str("outgoing"),
            Topic::Incoming => f.write_str("incoming"),
            Topic::Command(command_type) => write!(f, "{command_type}"),
        }
    }
}

struct Subscriber<T> {
    id: u64,
    topics: Vec<Topic>,
    tx: mpsc::Sender<T>,
    once: bool,
}

impl<T> Subscriber<T> {
    fn matches(&self, topics: &[Topic]) -> bool {
        self.topics.iter().any(|t| topics.contains(t))
    }
}

struct BusState<T> {
    subscribers: Vec<Subscriber<T>>,
    next_id: u64,
    closed: bool,
}

/// Bounded, topic-keyed publish/subscribe primitive.
pub struct EventBus<T> {
    state: Mutex<BusState<T>>,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            }),
        }
    }

    /// Returns a receiver fed by every publish on any of `topics`.
    ///
    /// Subscribing to a bus that has been shut down yields an already-closed
    /// receiver.
    pub fn subscribe(&self, topics: &[Topic]) -> mpsc::Receiver<T> {
        self.add_subscriber(topics, false)
    }

    /// Like [`subscribe`](Self::subscribe), but the subscription removes
    /// itself after delivering its first value.  The receiver then yields
    /// that value followed by `None`.
    pub fn subscribe_once(&self, topics: &[Topic]) -> mpsc::Receiver<T> {
        self.add_subscriber(topics, true)
    }

    /// Delivers `value` to every subscriber of any of `topics`, waiting for
    /// buffer space where a subscriber is saturated.
    ///
    /// A subscriber matching several of `topics` still receives one copy.
    /// Publishing after [`shutdown`](Self::shutdown) is a no-op.
    pub async fn publish(&self, value: T, topics: &[Topic]) {
        for tx in self.targets(topics) {
            if tx.send(value.clone()).await.is_err() {
                trace!("subscriber went away during publish");
            }
        }
    }

    /// Delivers `value` without waiting.  Subscribers whose buffer is full
    /// miss this value.
    ///
    /// Returns how many subscribers accepted the value.
    pub fn try_publish(&self, value: T, topics: &[Topic]) -> usize {
        let mut delivered = 0;
        for tx in self.targets(topics) {
            match tx.try_send(value.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => trace!("subscriber saturated; value dropped"),
                Err(TrySendError::Closed(_)) => trace!("subscriber went away during publish"),
            }
        }
        delivered
    }

    /// Closes every subscriber channel.  Safe to call more than once.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        // Dropping the senders closes the channels once buffered values drain.
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    fn add_subscriber(&self, topics: &[Topic], once: bool) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        let mut state = self.lock();
        if !state.closed {
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push(Subscriber {
                id,
                topics: topics.to_vec(),
                tx,
                once,
            });
        }
        rx
    }

    /// Snapshot of the senders matching `topics`.  One-shot subscribers are
    /// removed here, so each of them is selected by exactly one publish.
    fn targets(&self, topics: &[Topic]) -> Vec<mpsc::Sender<T>> {
        let mut state = self.lock();
        if state.closed {
            return Vec::new();
        }

        state.subscribers.retain(|s| !s.tx.is_closed());

        let mut selected = Vec::new();
        let mut spent = Vec::new();
        for subscriber in state.subscribers.iter().filter(|s| s.matches(topics)) {
            selected.push(subscriber.tx.clone());
            if subscriber.once {
                spent.push(subscriber.id);
            }
        }
        if !spent.is_empty() {
            state.subscribers.retain(|s| !spent.contains(&s.id));
        }
        selected
    }

    fn lock(&self) -> MutexGuard<'_, BusState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HEARTBEAT: Topic = Topic::Command(CommandType::Heartbeat);
    const STATUS: Topic = Topic::Command(CommandType::StatusUpdate);

    #[tokio::test]
    async fn test_each_subscriber_gets_its_own_copy() {
        // Arrange
        let bus = EventBus::new();
        let mut a = bus.subscribe(&[HEARTBEAT]);
        let mut b = bus.subscribe(&[HEARTBEAT]);

        // Act
        bus.publish(1u32, &[HEARTBEAT]).await;

        // Assert
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_publish_skips_other_topics() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[STATUS]);

        bus.publish(1u32, &[HEARTBEAT]).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriber_on_two_published_topics_gets_one_copy() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[Topic::Incoming, HEARTBEAT]);

        bus.publish(9u32, &[Topic::Incoming, HEARTBEAT]).await;
        bus.shutdown();

        assert_eq!(rx.recv().await, Some(9));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_values_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[Topic::Outgoing]);

        for i in 0..10u32 {
            bus.publish(i, &[Topic::Outgoing]).await;
        }

        for i in 0..10u32 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_subscribe_once_delivers_first_value_then_closes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_once(&[HEARTBEAT]);

        bus.publish(1u32, &[HEARTBEAT]).await;
        bus.publish(2u32, &[HEARTBEAT]).await;

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_try_publish_drops_for_saturated_subscriber_only() {
        // Arrange: fill the slow subscriber's buffer
        let bus = EventBus::new();
        let _slow = bus.subscribe(&[Topic::Outgoing]);
        for i in 0..BUS_CAPACITY as u32 {
            bus.try_publish(i, &[Topic::Outgoing]);
        }
        let mut fast = bus.subscribe(&[Topic::Outgoing]);

        // Act
        let delivered = bus.try_publish(99u32, &[Topic::Outgoing]);

        // Assert
        assert_eq!(delivered, 1, "only the subscriber with room accepts");
        assert_eq!(fast.recv().await, Some(99));
    }

    #[tokio::test]
    async fn test_publish_blocks_while_subscriber_is_full() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[Topic::Outgoing]);
        for i in 0..BUS_CAPACITY as u32 {
            bus.publish(i, &[Topic::Outgoing]).await;
        }

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), bus.publish(100, &[Topic::Outgoing])).await;
        assert!(blocked.is_err(), "publish must wait for buffer space");

        // Draining one slot lets the next publish through.
        assert_eq!(rx.recv().await, Some(0));
        let unblocked =
            tokio::time::timeout(Duration::from_millis(50), bus.publish(101, &[Topic::Outgoing])).await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers_and_ignores_later_publish() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[HEARTBEAT]);

        bus.shutdown();
        bus.shutdown();
        bus.publish(5u32, &[HEARTBEAT]).await;
        assert_eq!(bus.try_publish(6u32, &[HEARTBEAT]), 0);

        assert!(bus.is_closed());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_returns_closed_receiver() {
        let bus: EventBus<u32> = EventBus::new();
        bus.shutdown();

        let mut rx = bus.subscribe(&[HEARTBEAT]);

        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let bus: EventBus<u32> = EventBus::new();
        let rx = bus.subscribe(&[HEARTBEAT]);
        let _kept = bus.subscribe(&[HEARTBEAT]);
        drop(rx);

        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_topic_display_uses_wire_names() {
        assert_eq!(Topic::Outgoing.to_string(), "outgoing");
        assert_eq!(STATUS.to_string(), "status_update");
    }
}
