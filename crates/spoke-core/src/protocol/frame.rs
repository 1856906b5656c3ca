//! Binary framing for the Spoke wire protocol.
//!
//! Wire format:
//! ```text
//! [length:4][sender:16][receiver:16][payload:length-32]
//! ```
//! `length` counts both ids plus the payload, so an empty-payload frame
//! declares a length of 32 (`00 00 00 20`) and occupies 36 bytes on the wire.
//! All multi-byte integers are big-endian.
//!
//! # Why a length prefix? (for beginners)
//!
//! TCP and TLS deliver a *stream* of bytes, not discrete messages.  A reader
//! that knows the exact size of the next frame up front can allocate the
//! payload buffer once and call `read_exact`, instead of scanning for a
//! delimiter.  A single persistent stream can therefore carry an unbounded
//! sequence of independently-sized messages.
//!
//! The payload is opaque to this layer.  In practice it carries a JSON
//! [`Command`] envelope, but framing never looks inside it.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::protocol::command::{Command, CommandError};

/// Size of one peer identifier on the wire.
pub const ID_SIZE: usize = 16;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Smallest legal value of the length field: sender + receiver, no payload.
pub const MIN_FRAME_LENGTH: u32 = (ID_SIZE * 2) as u32;

/// Largest length field accepted from a peer (16 MiB).
///
/// A corrupt or hostile prefix must not be able to make the reader allocate
/// gigabytes before the first payload byte arrives.
pub const MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The declared length cannot even hold the two ids.
    #[error("declared frame length {0} is below the {MIN_FRAME_LENGTH}-byte minimum")]
    LengthTooShort(u32),

    /// The declared (or required) length is above [`MAX_FRAME_LENGTH`].
    #[error("frame length {0} exceeds the {MAX_FRAME_LENGTH}-byte limit")]
    LengthTooLong(usize),

    /// The byte slice does not yet contain a whole frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The stream ended part-way through a frame.
    #[error("stream ended inside a frame that declared {declared} bytes")]
    Truncated { declared: u32 },

    /// The stream ended cleanly on a frame boundary.
    #[error("stream closed by peer")]
    Closed,

    /// Any other transport failure.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Returns `true` for malformed-frame errors, as opposed to transport failures.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            FrameError::LengthTooShort(_)
                | FrameError::LengthTooLong(_)
                | FrameError::InsufficientData { .. }
                | FrameError::Truncated { .. }
        )
    }
}

/// One unit of traffic between two peers.
///
/// A nil `receiver` is the loopback sentinel: the message never leaves the
/// process that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Uuid,
    pub receiver: Uuid,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(sender: Uuid, receiver: Uuid, payload: Vec<u8>) -> Self {
        Self {
            sender,
            receiver,
            payload,
        }
    }

    /// Builds a message whose payload is the encoded `command`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command data cannot be serialised.
    pub fn from_command(
        sender: Uuid,
        receiver: Uuid,
        command: &Command,
    ) -> Result<Self, CommandError> {
        Ok(Self::new(sender, receiver, command.encode()?))
    }

    /// Value of the length field for this message (`32 + payload.len()`).
    pub fn length(&self) -> usize {
        MIN_FRAME_LENGTH as usize + self.payload.len()
    }

    /// Returns `true` when the receiver is the loopback sentinel.
    pub fn is_loopback(&self) -> bool {
        self.receiver.is_nil()
    }

    /// Decodes the payload as a [`Command`] envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the payload is not a valid envelope.
    pub fn command(&self) -> Result<Command, CommandError> {
        Command::decode(&self.payload)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `msg` into a complete frame, length prefix included.
///
/// # Errors
///
/// Returns [`FrameError::LengthTooLong`] if the payload would push the length
/// field past [`MAX_FRAME_LENGTH`].
///
/// # Examples
///
/// ```rust
/// use spoke_core::protocol::frame::{decode_message, encode_message, Message};
/// use uuid::Uuid;
///
/// let msg = Message::new(Uuid::new_v4(), Uuid::nil(), b"hi".to_vec());
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let length = msg.length();
    if length > MAX_FRAME_LENGTH as usize {
        return Err(FrameError::LengthTooLong(length));
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + length);
    buf.extend_from_slice(&(length as u32).to_be_bytes());
    buf.extend_from_slice(msg.sender.as_bytes());
    buf.extend_from_slice(msg.receiver.as_bytes());
    buf.extend_from_slice(&msg.payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed so a streaming caller
/// can advance its buffer.  [`FrameError::InsufficientData`] means "wait for
/// more bytes", every other error means the stream is unusable.
///
/// # Errors
///
/// Returns [`FrameError`] if the buffer is short or the length is out of range.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), FrameError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::InsufficientData {
            needed: LENGTH_PREFIX_SIZE,
            available: bytes.len(),
        });
    }

    let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    check_length(length)?;

    let total = LENGTH_PREFIX_SIZE + length as usize;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    Ok((split_body(&bytes[LENGTH_PREFIX_SIZE..total]), total))
}

/// Reads exactly one frame from an async stream.
///
/// A length below the 32-byte minimum fails immediately, before any body
/// bytes are awaited, so a malformed prefix never blocks the reader.
///
/// # Errors
///
/// - [`FrameError::Closed`] if the stream ends before a new frame starts.
/// - [`FrameError::LengthTooShort`] / [`FrameError::LengthTooLong`] for an
///   out-of-range length field.
/// - [`FrameError::Truncated`] if the stream ends inside the frame body.
/// - [`FrameError::Io`] for any other read failure.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(FrameError::Io(e)),
    }

    let length = u32::from_be_bytes(prefix);
    check_length(length)?;

    let mut body = vec![0u8; length as usize];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(split_body(&body)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::Truncated { declared: length })
        }
        Err(e) => Err(FrameError::Io(e)),
    }
}

/// Encodes `msg` and writes the whole frame to `writer`, then flushes.
///
/// # Errors
///
/// Returns [`FrameError`] if encoding or the write fails.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn check_length(length: u32) -> Result<(), FrameError> {
    if length < MIN_FRAME_LENGTH {
        return Err(FrameError::LengthTooShort(length));
    }
    if length > MAX_FRAME_LENGTH {
        return Err(FrameError::LengthTooLong(length as usize));
    }
    Ok(())
}

/// Splits a frame body (everything after the length prefix) into a message.
/// The caller has already checked that `body` holds both ids.
fn split_body(body: &[u8]) -> Message {
    let sender = read_id(&body[..ID_SIZE]);
    let receiver = read_id(&body[ID_SIZE..ID_SIZE * 2]);
    Message::new(sender, receiver, body[ID_SIZE * 2..].to_vec())
}

fn read_id(buf: &[u8]) -> Uuid {
    let mut raw = [0u8; ID_SIZE];
    raw.copy_from_slice(&buf[..ID_SIZE]);
    Uuid::from_bytes(raw)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
