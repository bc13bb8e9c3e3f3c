//! Outbound rate limiting.
//!
//! A token bucket shared by every session of a client: `limit` tokens,
//! refilled to full once per `interval`. Callers that find the bucket empty
//! wait in FIFO order; nobody is ever rejected.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

struct Bucket {
    tokens: u32,
    next_refill: Instant,
}

/// Token bucket admission gate.
pub struct RateLimiter {
    limit: u32,
    interval: Duration,
    /// tokio's mutex hands the lock out in request order, and the holder
    /// sleeps with it held, so the lock queue is the waiter queue.
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket. A `limit` of 0 is treated as 1.
    pub fn new(limit: u32, interval: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            interval,
            bucket: Mutex::new(Bucket {
                tokens: limit,
                next_refill: Instant::now() + interval,
            }),
        }
    }

    /// Wait until a token is available and take it.
    ///
    /// Dropping the future while it waits gives up the place in the queue
    /// without consuming anything.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            self.refill(&mut bucket, now);

            if bucket.tokens > 0 {
                bucket.tokens -= 1;
                return;
            }

            trace!(
                wait = ?bucket.next_refill.saturating_duration_since(now),
                "rate limit reached"
            );
            sleep_until(bucket.next_refill).await;
        }
    }

    /// Take a token only if one is free and nobody is queued.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens left in the current window (waits behind queued callers).
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if now >= bucket.next_refill {
            bucket.tokens = self.limit;
            bucket.next_refill = now + self.interval;
        }
    }
}
