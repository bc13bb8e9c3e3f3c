//! VNDB TCP protocol engine.
//!
//! Architecture:
//! - `transport`: Plain TCP or TLS byte stream under a session
//! - `protocol`: Frame encoding/decoding and response classification
//! - `connection`: Session state machine (connect, login, send, close)
//! - `limiter`: Token bucket shared by all sessions
//! - `pool`: Bounded pool of authenticated sessions with idle eviction
//! - `retry`: What to do with a server error (wait and resubmit, or surface)

pub mod connection;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;


pub use connection::{Connection, SessionState};
pub use error::{WireError, WireResult};
pub use limiter::RateLimiter;
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use protocol::{
    Command, DbStats, FrameDecoder, LoginMessage, Response, ResultSet, ServerError,
    ServerErrorKind,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{Connector, Transport};
