//! Query dispatcher.
//!
//! Every query takes a rate-limit token, borrows a session from the pool,
//! sends the command and hands the session back. When the server answers
//! that it is throttling us, the whole cycle runs again after the wait it
//! asked for.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Result, VndbError};
use crate::wire::{
    Command, Connection, DbStats, Pool, PoolStatus, RateLimiter, Response, RetryDecision,
    RetryPolicy, WireError,
};

/// A pooled, rate-limited client for one server.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl Client {
    /// Validate the configuration and open the pool.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit,
            config.rate_interval.as_duration(),
        ));
        let retry = RetryPolicy::new(config.max_throttle_retries);
        let pool = Pool::connect(config).await?;

        Ok(Self {
            pool,
            limiter,
            retry,
        })
    }

    /// Run one command and return its response.
    ///
    /// Server `error` responses come back as `Err`: throttling is waited out
    /// and retried here, anything else is returned unchanged. A transport
    /// failure destroys the session and is not retried, since the server may
    /// already have applied the command.
    pub async fn query(&self, command: impl Into<Command>) -> Result<Response> {
        let command = command.into().to_string();
        let mut attempt = 0;

        loop {
            self.limiter.acquire().await;
            let mut session = self.pool.acquire().await?;
            let response = session.send(&command).await;
            // Healthy sessions go back to idle, broken ones are closed.
            drop(session);

            match response? {
                Response::Error(error) => match self.retry.decide(&error, attempt) {
                    RetryDecision::Retry(wait) => {
                        warn!(attempt, retry_after = ?wait, msg = %error.msg, "throttled by server");
                        attempt += 1;
                        sleep(wait).await;
                    }
                    RetryDecision::Surface => return Err(RetryPolicy::into_error(error).into()),
                },
                response => return Ok(response),
            }
        }
    }

    /// Fetch database statistics.
    pub async fn stats(&self) -> Result<DbStats> {
        match self.query(Command::dbstats()).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(WireError::MalformedFrame(format!(
                "expected dbstats, got '{}'",
                other.token()
            ))
            .into()),
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Drain the pool: refuse new queries, wait for running ones, close every session.
    pub async fn close(&self) {
        self.pool.drain().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

/// Run one command on a dedicated session, without a pool.
///
/// Opens and logs in a fresh connection, sends the command (waiting out
/// throttling on the same socket), then closes it. No rate limiting is
/// applied across calls.
pub async fn query_once(config: &ClientConfig, command: impl Into<Command>) -> Result<Response> {
    config.validate()?;
    let command = command.into().to_string();
    let retry = RetryPolicy::new(config.max_throttle_retries);

    let mut conn = Connection::open(config).await?;
    let mut attempt = 0;

    let result = loop {
        match conn.send(&command).await {
            Ok(Response::Error(error)) => match retry.decide(&error, attempt) {
                RetryDecision::Retry(wait) => {
                    warn!(attempt, retry_after = ?wait, "throttled by server");
                    attempt += 1;
                    sleep(wait).await;
                }
                RetryDecision::Surface => break Err(RetryPolicy::into_error(error)),
            },
            other => break other,
        }
    };

    if let Err(e) = conn.close().await {
        debug!(session = conn.id(), error = %e, "unclean close");
    }
    result.map_err(VndbError::from)
}
