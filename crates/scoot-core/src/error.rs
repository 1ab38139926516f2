//! Error types for the scoot wire protocol.
//!
//! This module defines the central `Error` enum shared by the codec, the
//! tagged connection, the demultiplexer and the client. Every variant is
//! `Clone` so that a single failure observed by the demultiplexer's reader can
//! be re-raised to every waiter on every tag.
//!
//! ## Error Cases
//! - `UnknownType`: A frame carried a type code the registry does not know.
//! - `Unregistered`: A message kind was sent that has no registered code.
//! - `DuplicateRegistration`: The registry was built with a repeated code or
//!   kind.
//! - `Malformed` / `StringTooLong`: The payload could not be decoded or
//!   encoded.
//! - `FrameTooLarge`: A frame exceeds the codec's length limit.
//! - `PeerClosed` / `ConnectionClosed`: The remote side or the local side
//!   closed the connection.
//! - `Io`: Any other transport failure.
//! - `UnexpectedMessage`: A well-formed message arrived where another kind was
//!   expected.
//! - `NotAuthenticated`: The server refused a request that requires a login.

use crate::MessageKind;
use std::sync::Arc;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the scoot protocol.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// A frame carried a type code with no registered message kind.
    #[error("Unknown message type code: {code}")]
    UnknownType { code: i32 },

    /// A message kind with no registered type code was about to be sent.
    #[error("No type code registered for {kind:?}")]
    Unregistered { kind: MessageKind },

    /// The same code or kind was registered twice.
    #[error("Duplicate registration: {context}")]
    DuplicateRegistration { context: String },

    /// The payload did not match the layout of its message kind.
    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    /// A string does not fit in the 16-bit length prefix.
    #[error("String of {len} bytes exceeds the 65535 byte limit")]
    StringTooLong { len: usize },

    /// A frame, sent or received, exceeds the codec's length limit.
    #[error("Frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    /// The remote side closed the stream, possibly in the middle of a frame.
    #[error("Peer closed the connection")]
    PeerClosed,

    /// The connection was closed locally.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A message of the wrong kind arrived.
    #[error("Unexpected message: {kind:?}")]
    UnexpectedMessage { kind: MessageKind },

    /// The request requires an authenticated session.
    #[error("Not authenticated")]
    NotAuthenticated,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => Self::PeerClosed,
            _ => Self::Io(Arc::new(err)),
        }
    }
}

impl Error {
    /// Whether the error means the transport is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::ConnectionClosed)
    }
}
