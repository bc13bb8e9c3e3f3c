//! Session pool.
//!
//! Sessions are created on demand up to `max_connections`, lent out one
//! caller at a time, and returned on drop. Idle sessions older than
//! `idle_timeout` are closed by a background sweep, never going below
//! `min_connections`.
//!
//! Every session is counted in exactly one of `idle`, `leased`, `connecting`
//! or `destroying`. A semaphore with `max_connections` permits bounds the
//! callers holding or creating a session; idle sessions hold no permit.
//! Sessions in `destroying` are closing and count against nothing, but
//! `drain` waits for them.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::connection::Connection;
use super::error::{WireError, WireResult};
use super::protocol::Response;
use super::transport::Connector;
use crate::config::ClientConfig;

// ============================================================================
// Pool Status
// ============================================================================

/// Snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub leased: usize,
    pub connecting: usize,
    /// Sessions whose close handshake is still running
    pub destroying: usize,
    pub max: usize,
}

impl PoolStatus {
    /// Sessions counted against `max`: idle, leased and connecting.
    pub fn total(&self) -> usize {
        self.idle + self.leased + self.connecting
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A session checked out from the pool.
///
/// When dropped, a healthy `Ready` session goes back to the idle set. A
/// session that broke, or was dropped mid-command, is closed instead.
pub struct PooledConnection {
    /// The actual connection (None once handed back)
    conn: Option<Connection>,
    /// Reference back to the pool
    pool: Arc<PoolInner>,
    /// Set when the session must not be reused
    broken: bool,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Send one command on this session.
    pub async fn send(&mut self, command: &str) -> WireResult<Response> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| WireError::InvalidState("session already returned".to_string()))?;

        let result = conn.send(command).await;
        if conn.is_closed() {
            self.broken = true;
        }
        result
    }

    /// Return the session to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the session instead of returning it.
    pub fn discard(mut self) {
        self.broken = true;
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    /// Check if the session can go back to the idle set.
    pub fn is_healthy(&self) -> bool {
        !self.broken && self.conn.as_ref().map(|c| c.is_ready()).unwrap_or(false)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let reusable = !self.broken && conn.is_ready();
        let mut state = self.pool.state.lock();
        state.leased = state.leased.saturating_sub(1);

        if reusable && !state.closed {
            trace!(session = conn.id(), "session returned to pool");
            state.idle.push_back(IdleConnection::new(conn));
            drop(state);
        } else {
            let destroying = Destroying::enter(&self.pool, &mut state);
            drop(state);
            debug!(session = conn.id(), state = ?conn.state(), "destroying session");
            destroy(conn, destroying);
        }

        self.pool.returned.notify_waiters();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("broken", &self.broken)
            .finish()
    }
}

/// Close a session in the background, or just drop the socket when no
/// runtime is around to drive the close handshake.
fn destroy(conn: Connection, destroying: Destroying) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(close_session(conn, destroying));
    }
}

async fn close_session(mut conn: Connection, _destroying: Destroying) {
    if let Err(e) = conn.close().await {
        debug!(session = conn.id(), error = %e, "unclean close");
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

impl IdleConnection {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            since: Instant::now(),
        }
    }
}

struct PoolState {
    /// Oldest at the front; reuse takes from the back.
    idle: VecDeque<IdleConnection>,
    leased: usize,
    connecting: usize,
    destroying: usize,
    closed: bool,
}

/// Internal pool state.
struct PoolInner {
    /// Pool configuration
    config: ClientConfig,
    /// Opens plain or TLS transports
    connector: Connector,
    /// All bookkeeping, behind one lock
    state: Mutex<PoolState>,
    /// Semaphore to limit leased + connecting sessions
    semaphore: Arc<Semaphore>,
    /// Signalled whenever a lease, a creation or a close ends
    returned: Notify,
    /// Idle eviction task
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Counts a session as `connecting` until it is leased, parked, or abandoned.
struct Connecting {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Connecting {
    /// Count a creation under the caller's lock, so a concurrent `drain`
    /// either waits for it or the caller sees `closed`.
    fn start(pool: &Arc<PoolInner>, state: &mut PoolState) -> Self {
        state.connecting += 1;
        Self {
            pool: Arc::clone(pool),
            armed: true,
        }
    }

    fn lease(mut self) {
        let mut state = self.pool.state.lock();
        state.connecting = state.connecting.saturating_sub(1);
        state.leased += 1;
        self.armed = false;
    }

    /// Put the new session in the idle set, or close it if the pool closed meanwhile.
    fn park(mut self, conn: Connection) {
        let mut state = self.pool.state.lock();
        state.connecting = state.connecting.saturating_sub(1);
        self.armed = false;

        if state.closed {
            let destroying = Destroying::enter(&self.pool, &mut state);
            drop(state);
            self.pool.returned.notify_waiters();
            destroy(conn, destroying);
            return;
        }
        state.idle.push_back(IdleConnection::new(conn));
    }
}

impl Drop for Connecting {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.connecting = state.connecting.saturating_sub(1);
            drop(state);
            self.pool.returned.notify_waiters();
        }
    }
}

/// Counts a session as `destroying` until its close finishes or is abandoned.
struct Destroying {
    pool: Arc<PoolInner>,
}

impl Destroying {
    fn enter(pool: &Arc<PoolInner>, state: &mut PoolState) -> Self {
        state.destroying += 1;
        Self {
            pool: Arc::clone(pool),
        }
    }
}

impl Drop for Destroying {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.destroying = state.destroying.saturating_sub(1);
        drop(state);
        self.pool.returned.notify_waiters();
    }
}

enum Checkout {
    Idle(IdleConnection),
    Create(Connecting),
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A pool of authenticated sessions to one server.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create the pool, open `min_connections` sessions and start the eviction sweep.
    pub async fn connect(config: ClientConfig) -> WireResult<Self> {
        let connector = Connector::new(&config)?;
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                leased: 0,
                connecting: 0,
                destroying: 0,
                closed: false,
            }),
            returned: Notify::new(),
            reaper: Mutex::new(None),
        });

        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.config.min_connections {
            let connecting = Connecting::start(&pool.inner, &mut pool.inner.state.lock());
            let conn = pool.create_connection().await?;
            connecting.park(conn);
        }

        pool.spawn_reaper();
        info!(
            host = %pool.inner.config.host,
            port = pool.inner.config.port,
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "pool ready"
        );
        Ok(pool)
    }

    /// Get a session from the pool.
    ///
    /// Reuses an idle session if there is one, otherwise opens a new one
    /// while under `max_connections`, otherwise waits for a release (bounded
    /// by `acquire_timeout`). Dropping the future while it waits leaves the
    /// pool untouched.
    pub async fn acquire(&self) -> WireResult<PooledConnection> {
        if self.is_closed() {
            return Err(WireError::PoolClosed);
        }

        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => timeout(limit, semaphore.acquire_owned())
                .await
                .map_err(|_| WireError::PoolTimeout(limit))?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| WireError::PoolClosed)?;

        // Reuse an idle session, or claim a creation slot under the same lock
        let checkout = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(WireError::PoolClosed);
            }
            match state.idle.pop_back() {
                Some(idle) => {
                    state.leased += 1;
                    Checkout::Idle(idle)
                }
                None => Checkout::Create(Connecting::start(&self.inner, &mut state)),
            }
        };

        let conn = match checkout {
            Checkout::Idle(idle) => {
                trace!(session = idle.conn.id(), "reusing idle session");
                idle.conn
            }
            Checkout::Create(connecting) => {
                let conn = self.create_connection().await?;
                connecting.lease();
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            broken: false,
            _permit: permit,
        })
    }

    /// One eviction pass.
    ///
    /// Closes idle sessions unused for longer than `idle_timeout`, oldest
    /// first, without dropping below `min_connections`; then opens sessions
    /// if the pool fell under the minimum. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let min = self.inner.config.min_connections as usize;

        let expired = {
            let mut state = self.inner.state.lock();
            let mut total = state.idle.len() + state.leased + state.connecting;
            let mut expired: Vec<(Connection, Destroying)> = Vec::new();

            while total > min {
                let stale = state
                    .idle
                    .front()
                    .map(|idle| idle.since.elapsed() >= idle_timeout)
                    .unwrap_or(false);
                if !stale {
                    break;
                }
                if let Some(idle) = state.idle.pop_front() {
                    let destroying = Destroying::enter(&self.inner, &mut state);
                    expired.push((idle.conn, destroying));
                    total -= 1;
                }
            }
            expired
        };

        let evicted = expired.len();
        for (conn, destroying) in expired {
            debug!(session = conn.id(), "evicting idle session");
            close_session(conn, destroying).await;
        }

        self.replenish().await;
        evicted
    }

    /// Stop handing out sessions, wait for every lease and creation to end,
    /// then close all sessions. Returns once every close has finished,
    /// including those of sessions destroyed on release.
    pub async fn drain(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.closed = true;
                info!(
                    idle = state.idle.len(),
                    leased = state.leased,
                    connecting = state.connecting,
                    "draining pool"
                );
            }
        }
        self.inner.semaphore.close();
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }

        self.wait_until(|state| state.leased == 0 && state.connecting == 0)
            .await;

        let idle: Vec<(Connection, Destroying)> = {
            let mut state = self.inner.state.lock();
            let sessions: Vec<IdleConnection> = state.idle.drain(..).collect();
            sessions
                .into_iter()
                .map(|idle| (idle.conn, Destroying::enter(&self.inner, &mut state)))
                .collect()
        };
        for (conn, destroying) in idle {
            close_session(conn, destroying).await;
        }

        self.wait_until(|state| state.destroying == 0).await;
        info!("pool drained");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            leased: state.leased,
            connecting: state.connecting,
            destroying: state.destroying,
            max: self.inner.config.max_connections as usize,
        }
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open and log in a new session. The caller holds its `Connecting` slot.
    async fn create_connection(&self) -> WireResult<Connection> {
        let conn = Connection::open_with(&self.inner.connector, &self.inner.config).await?;
        debug!(session = conn.id(), "created session");
        Ok(conn)
    }

    /// Park until `done` holds for the pool state.
    async fn wait_until(&self, done: impl Fn(&PoolState) -> bool) {
        loop {
            let notified = self.inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if done(&*self.inner.state.lock()) {
                return;
            }
            notified.await;
        }
    }

    /// Open idle sessions until the pool is back at `min_connections`.
    async fn replenish(&self) {
        let min = self.inner.config.min_connections as usize;
        loop {
            let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
                return;
            };

            let connecting = {
                let mut state = self.inner.state.lock();
                if state.closed || state.idle.len() + state.leased + state.connecting >= min {
                    return;
                }
                Connecting::start(&self.inner, &mut state)
            };

            match self.create_connection().await {
                Ok(conn) => connecting.park(conn),
                Err(e) => {
                    warn!(error = %e, "could not restore minimum pool size");
                    return;
                }
            }
            drop(permit);
        }
    }

    fn spawn_reaper(&self) {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.eviction_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let pool = Pool { inner };
                if pool.is_closed() {
                    break;
                }
                let evicted = pool.evict_idle().await;
                if evicted > 0 {
                    debug!(evicted, idle = pool.idle_count(), "evicted idle sessions");
                }
            }
        });

        *self.inner.reaper.lock() = Some(handle);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.inner.config.addr())
            .field("status", &self.status())
            .finish()
    }
}
