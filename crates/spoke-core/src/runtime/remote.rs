//! One network stream and the two tasks that service it.
//!
//! A [`Remote`] splits its stream into a read half and a write half:
//!
//! - the **reader** decodes frames, each read bounded by `max_idle_time`,
//!   and publishes them on the owning Controller's bus;
//! - the **writer** drains [`Topic::Outgoing`] and writes each frame within
//!   `write_timeout`.
//!
//! Any decode error, EOF, deadline expiry or write failure terminates the
//! Remote.  Termination is idempotent: the [`ClosedSignal`] fires exactly
//! once no matter how many times, or from which task, it is requested.  Both
//! tasks observe the signal and drop their half, which closes the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bus::{EventBus, Topic};
use crate::protocol::{read_message, write_message, FrameError, Message};

/// Deadlines applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Longest silence tolerated between two inbound frames.
    pub max_idle_time: Duration,
    /// Longest time a single outbound frame may take to write.
    pub write_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Cloneable notification that fires once, when a Remote terminates.
#[derive(Debug, Clone)]
pub struct ClosedSignal {
    rx: watch::Receiver<bool>,
}

impl ClosedSignal {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the Remote has terminated.  Resolves immediately if it
    /// already has.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // An error means the sender is gone, which only happens after
        // termination anyway.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// State shared by the Remote handle and its two tasks.
struct Shared {
    owner: Uuid,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn terminate(&self, reason: &str) {
        let first = self.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if first {
            debug!(controller = %self.owner, reason, "remote terminated");
        }
    }

    fn closed(&self) -> ClosedSignal {
        ClosedSignal {
            rx: self.closed_tx.subscribe(),
        }
    }
}

/// Handle to a running connection.  Dropping it terminates the connection.
pub struct Remote {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Remote {
    /// Starts servicing `stream` on behalf of the Controller `owner`.
    ///
    /// The outgoing subscription is registered before this returns, so a
    /// message published right after `spawn` is not lost.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(stream: S, bus: Arc<EventBus<Message>>, config: RemoteConfig, owner: Uuid) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared { owner, closed_tx });

        let (read_half, write_half) = tokio::io::split(stream);
        let outgoing = bus.subscribe(&[Topic::Outgoing]);

        let reader = tokio::spawn(read_loop(
            read_half,
            bus,
            Arc::clone(&shared),
            config.max_idle_time,
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            outgoing,
            Arc::clone(&shared),
            config.write_timeout,
        ));

        debug!(controller = %owner, "remote started");
        Self {
            shared,
            reader,
            writer,
        }
    }

    /// Hard-terminates the connection.  Safe to call repeatedly.
    pub fn terminate(&self) {
        self.shared.terminate("terminated by owner");
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    pub fn closed(&self) -> ClosedSignal {
        self.shared.closed()
    }

    /// Returns `true` once both service tasks have exited.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        self.shared.terminate("remote handle dropped");
    }
}

// ── Service loops ─────────────────────────────────────────────────────────────

async fn read_loop<R>(mut reader: R, bus: Arc<EventBus<Message>>, shared: Arc<Shared>, max_idle: Duration)
where
    R: AsyncRead + Unpin,
{
    let closed = shared.closed();
    let reason = loop {
        let read = tokio::select! {
            _ = closed.wait() => break "closed",
            read = timeout(max_idle, read_message(&mut reader)) => read,
        };

        let msg = match read {
            Err(_) => break "idle deadline exceeded",
            Ok(Err(FrameError::Closed)) => break "stream closed by peer",
            Ok(Err(e)) => {
                warn!(controller = %shared.owner, error = %e, "read failed");
                break "read failed";
            }
            Ok(Ok(msg)) => msg,
        };

        let command_type = match msg.command() {
            Ok(command) => command.command_type,
            Err(e) => {
                warn!(
                    controller = %shared.owner,
                    sender = %msg.sender,
                    error = %e,
                    "dropping frame with malformed command"
                );
                continue;
            }
        };
        trace!(controller = %shared.owner, sender = %msg.sender, %command_type, "frame received");

        // Everything from the wire goes to `Incoming`; only frames addressed
        // to this end are dispatched to command handlers.
        let addressed_here = msg.receiver.is_nil() || msg.receiver == shared.owner;
        let incoming = [Topic::Incoming, Topic::Command(command_type)];
        let topics = if addressed_here { &incoming[..] } else { &incoming[..1] };

        tokio::select! {
            _ = closed.wait() => break "closed",
            _ = bus.publish(msg, topics) => {}
        }
    };
    shared.terminate(reason);
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let closed = shared.closed();
    let reason = loop {
        let msg = tokio::select! {
            biased;
            _ = closed.wait() => break "closed",
            next = outgoing.recv() => match next {
                Some(msg) => msg,
                None => break "outgoing topic closed",
            },
        };

        match timeout(write_timeout, write_message(&mut writer, &msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(controller = %shared.owner, error = %e, "write failed");
                break "write failed";
            }
            Err(_) => break "write deadline exceeded",
        }
    };
    shared.terminate(reason);

    if timeout(write_timeout, writer.shutdown()).await.is_err() {
        trace!(controller = %shared.owner, "stream shutdown timed out");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_message, Command, CommandType};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn config(max_idle_ms: u64) -> RemoteConfig {
        RemoteConfig {
            max_idle_time: Duration::from_millis(max_idle_ms),
            write_timeout: Duration::from_millis(500),
        }
    }

    fn heartbeat_frame(sender: Uuid, receiver: Uuid) -> Vec<u8> {
        let msg = Message::from_command(sender, receiver, &Command::heartbeat()).unwrap();
        encode_message(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_idle_remote_fires_closed_after_deadline() {
        // Arrange
        let bus = Arc::new(EventBus::new());
        let (local, _peer) = duplex(1024);
        let remote = Remote::spawn(local, bus, config(50), Uuid::new_v4());
        let closed = remote.closed();

        // Act
        tokio::time::sleep(Duration::from_millis(60)).await;
        let fired = timeout(Duration::from_millis(100), closed.wait()).await;

        // Assert
        assert!(fired.is_ok(), "closed signal must fire after the idle deadline");
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn test_inbound_frame_is_published_on_incoming_and_command_topic() {
        let owner = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let bus = Arc::new(EventBus::new());
        let mut incoming = bus.subscribe(&[Topic::Incoming]);
        let mut heartbeats = bus.subscribe(&[Topic::Command(CommandType::Heartbeat)]);
        let (local, mut peer) = duplex(1024);
        let _remote = Remote::spawn(local, Arc::clone(&bus), config(1_000), owner);

        peer.write_all(&heartbeat_frame(sender, owner)).await.unwrap();

        assert_eq!(incoming.recv().await.unwrap().sender, sender);
        assert_eq!(heartbeats.recv().await.unwrap().sender, sender);
    }

    #[tokio::test]
    async fn test_frame_for_another_peer_skips_command_topic() {
        let bus = Arc::new(EventBus::new());
        let mut incoming = bus.subscribe(&[Topic::Incoming]);
        let mut heartbeats = bus.subscribe(&[Topic::Command(CommandType::Heartbeat)]);
        let (local, mut peer) = duplex(1024);
        let _remote = Remote::spawn(local, Arc::clone(&bus), config(1_000), Uuid::new_v4());

        peer.write_all(&heartbeat_frame(Uuid::new_v4(), Uuid::new_v4())).await.unwrap();

        assert!(incoming.recv().await.is_some());
        assert!(heartbeats.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_command_is_dropped_without_closing() {
        let owner = Uuid::new_v4();
        let bus = Arc::new(EventBus::new());
        let mut incoming = bus.subscribe(&[Topic::Incoming]);
        let (local, mut peer) = duplex(1024);
        let remote = Remote::spawn(local, Arc::clone(&bus), config(1_000), owner);

        let junk = encode_message(&Message::new(Uuid::new_v4(), owner, b"not json".to_vec())).unwrap();
        peer.write_all(&junk).await.unwrap();
        peer.write_all(&heartbeat_frame(Uuid::new_v4(), owner)).await.unwrap();

        let received = incoming.recv().await.unwrap();
        assert_eq!(received.command().unwrap(), Command::heartbeat());
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn test_short_length_terminates_remote() {
        let bus = Arc::new(EventBus::new());
        let (local, mut peer) = duplex(1024);
        let remote = Remote::spawn(local, bus, config(1_000), Uuid::new_v4());

        peer.write_all(&[0x00, 0x00, 0x00, 0x10]).await.unwrap();

        timeout(Duration::from_millis(200), remote.closed().wait())
            .await
            .expect("framing error must close the remote");
    }

    #[tokio::test]
    async fn test_outgoing_message_is_written_to_stream() {
        let owner = Uuid::new_v4();
        let bus = Arc::new(EventBus::new());
        let (local, mut peer) = duplex(1024);
        let _remote = Remote::spawn(local, Arc::clone(&bus), config(1_000), owner);
        let msg = Message::from_command(owner, Uuid::new_v4(), &Command::heartbeat()).unwrap();
        let expected = encode_message(&msg).unwrap();

        bus.publish(msg, &[Topic::Outgoing]).await;

        let mut written = vec![0u8; expected.len()];
        peer.read_exact(&mut written).await.unwrap();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_closes_stream() {
        let bus = Arc::new(EventBus::new());
        let (local, mut peer) = duplex(1024);
        let remote = Remote::spawn(local, bus, config(1_000), Uuid::new_v4());

        remote.terminate();
        remote.terminate();

        assert!(remote.closed().is_closed());
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_millis(200), peer.read(&mut buf))
            .await
            .expect("peer must observe the close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_service_tasks_finish_after_close() {
        let bus = Arc::new(EventBus::new());
        let (local, _peer) = duplex(1024);
        let remote = Remote::spawn(local, bus, config(1_000), Uuid::new_v4());
        assert!(!remote.is_finished());

        remote.terminate();

        timeout(Duration::from_millis(500), async {
            while !remote.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reader and writer must exit once closed");
    }

    #[tokio::test]
    async fn test_peer_eof_terminates_remote() {
        let bus = Arc::new(EventBus::new());
        let (local, peer) = duplex(1024);
        let remote = Remote::spawn(local, bus, config(1_000), Uuid::new_v4());

        drop(peer);

        timeout(Duration::from_millis(200), remote.closed().wait())
            .await
            .expect("EOF must close the remote");
    }
}
