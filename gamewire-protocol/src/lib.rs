//! # gamewire-protocol
//!
//! Wire protocol implementation for gamewire.
//!
//! This crate provides:
//! - The [`Message`] unit and its `(master, slave)` command code pair
//! - Binary framing with a fixed marker, length prefix and structural check code
//! - A buffered decoder and a `tokio_util` codec for framed transports
//! - JSON text frames with an MD5 integrity field for websocket clients
//! - Protocol error types and constants

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod text;

pub use codec::{Decoder, MessageCodec};
pub use error::ProtocolError;
pub use frame::{check_code, BODY_HEAD, MIN_FRAME_SIZE};
pub use message::{CommandCode, Message};
pub use text::TextFrame;

/// Default port for the command listener.
pub const DEFAULT_PORT: u16 = 9527;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
