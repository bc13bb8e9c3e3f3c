//! Throttle retry policy.
//!
//! Decides, for a server `error` response, whether the dispatcher waits and
//! resubmits or hands the error to the caller.

use std::time::Duration;

use super::error::WireError;
use super::protocol::{ServerError, ServerErrorKind};

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then run the whole query again (new token, new lease).
    Retry(Duration),
    /// Return the error to the caller.
    Surface,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    /// Throttle retries allowed per query; `None` retries for as long as the server asks.
    max_retries: Option<u32>,
}

impl RetryPolicy {
    pub fn new(max_retries: Option<u32>) -> Self {
        Self { max_retries }
    }

    /// `attempt` counts retries already made for this query.
    pub fn decide(&self, error: &ServerError, attempt: u32) -> RetryDecision {
        match error.kind() {
            ServerErrorKind::Throttled { retry_after } => match self.max_retries {
                Some(max) if attempt >= max => RetryDecision::Surface,
                _ => RetryDecision::Retry(retry_after),
            },
            ServerErrorKind::Application => RetryDecision::Surface,
        }
    }

    /// Wrap a surfaced server error in the matching error kind.
    pub fn into_error(error: ServerError) -> WireError {
        match error.kind() {
            ServerErrorKind::Throttled { retry_after } => WireError::Throttled { error, retry_after },
            ServerErrorKind::Application => WireError::Application(error),
        }
    }
}
