//! Error taxonomy shared across the client.
//!
//! Connection-fatal failures (`Transport`, `Closed`) are distinguished from
//! per-call failures (`Protocol`, `NotFound`, `NotImplemented`) and from
//! local concerns (`CacheIo`, `Import`) so callers can isolate them.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Stream setup/read/write failure. Fatal to the connection.
    Transport(io::Error),
    /// Malformed frame or a protocol-level violation on one call.
    Protocol(String),
    /// Object-by-name/by-id lookup miss, or an asset the peer does not have.
    NotFound(String),
    /// Local disk read/write failure in the asset cache.
    CacheIo(io::Error),
    /// Failure reported by the presentation-engine importer.
    Import(String),
    /// The peer does not implement the requested operation.
    NotImplemented(String),
    /// The connection reached its terminal failed state.
    Closed,
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::CacheIo(e) => write!(f, "cache I/O error: {e}"),
            Error::Import(msg) => write!(f, "import error: {msg}"),
            Error::NotImplemented(what) => write!(f, "not implemented: {what}"),
            Error::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) | Error::CacheIo(e) => Some(e),
            _ => None,
        }
    }
}
