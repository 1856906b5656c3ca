//! Protocol module containing the frame codec and the command envelope.

pub mod command;
pub mod frame;

pub use command::{Command, CommandError, CommandType, DisconnectRequest};
pub use frame::{decode_message, encode_message, read_message, write_message, FrameError, Message};
