//! # iorelay-protocol
//!
//! Wire messages exchanged between iorelay and its clients.
//!
//! This crate provides:
//! - The closed set of relay events produced by the backing store
//! - Client commands and server replies
//! - Line-delimited JSON encoding
//! - Stable error codes

pub mod codec;
pub mod error;
pub mod event;
pub mod message;

pub use codec::{encode_line, LineDecoder};
pub use error::{ErrorCode, ProtocolError};
pub use event::{EventKind, RelayEvent};
pub use message::{ClientMessage, ServerMessage};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for the relay.
pub const DEFAULT_PORT: u16 = 8084;

/// Maximum length of a single JSON line (1 MiB).
pub const MAX_LINE_SIZE: usize = 1024 * 1024;
