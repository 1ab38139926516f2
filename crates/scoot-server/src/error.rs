//! Error types for the scoot server.
//!
//! Domain outcomes such as "nothing in range" or a rejected termination are
//! not errors; they are ordinary return values of the store and the ledger.
//! This enum only covers failures that stop a connection, a startup step or
//! the server itself.

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Wire protocol or transport failure on one connection.
    #[error("Protocol error: {0}")]
    Protocol(#[from] scoot_core::Error),

    /// The listening socket could not be opened.
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Grid dimensions that cannot be tiled into `2 * radius` chunks.
    #[error("Invalid grid: {reason}")]
    InvalidGrid { reason: String },

    /// The user seed file could not be read or parsed.
    #[error("Invalid users file: {reason}")]
    UsersFile { reason: String },
}
