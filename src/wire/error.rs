//! Error types for the VNDB wire protocol implementation.

use std::fmt;
use std::io;
use std::time::Duration;

use super::protocol::ServerError;

/// Result type for wire-level operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while talking to the server.
#[derive(Debug)]
pub enum WireError {
    /// Socket-level failure before the connection was established.
    Connect(String),

    /// Login handshake rejected, malformed, or timed out.
    Auth(String),

    /// A frame could not be decoded (missing header, bad JSON, bad UTF-8).
    MalformedFrame(String),

    /// Server answered with an `error` frame that is not throttling.
    Application(ServerError),

    /// Server is throttling this client and asked us to wait.
    Throttled {
        error: ServerError,
        retry_after: Duration,
    },

    /// No session became available before the acquisition deadline.
    PoolTimeout(Duration),

    /// The pool has been drained and no longer hands out sessions.
    PoolClosed,

    /// Transport failed while a command was in flight.
    ConnectionLost(String),

    /// Operation is not valid in the session's current state.
    InvalidState(String),

    /// I/O error outside of an in-flight command.
    Io(io::Error),
}

impl WireError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WireError::ConnectionLost(_)
                | WireError::PoolTimeout(_)
                | WireError::Connect(_)
                | WireError::Throttled { .. }
                | WireError::Io(_)
        )
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, WireError::Throttled { .. })
    }

    /// The server error carried by `Application` and `Throttled`.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            WireError::Application(e) => Some(e),
            WireError::Throttled { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Connect(msg) => write!(f, "Connection failed: {}", msg),
            WireError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            WireError::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            WireError::Application(e) => write!(f, "Server error ({}): {}", e.id, e.msg),
            WireError::Throttled { error, retry_after } => write!(
                f,
                "Throttled ({}), retry after {:?}",
                error.msg, retry_after
            ),
            WireError::PoolTimeout(waited) => {
                write!(f, "Timed out after {:?} waiting for a connection", waited)
            }
            WireError::PoolClosed => write!(f, "Pool is closed"),
            WireError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            WireError::InvalidState(msg) => write!(f, "Invalid connection state: {}", msg),
            WireError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        WireError::Io(e)
    }
}
