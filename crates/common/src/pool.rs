//! Bounded, health-checked connection pool.
//!
//! One [`ConnectionPool`] exists per distinct connection target. The pool is
//! generic over a [`ManageConnection`] implementation so the relational
//! backend can plug in a PostgreSQL client while tests use an in-memory
//! manager.
//!
//! Lifecycle:
//! 1. [`ConnectionPool::connect`] opens `min_size` connections up front and
//!    starts the background health task.
//! 2. [`ConnectionPool::acquire`] waits up to `acquire_timeout` for a slot and
//!    fails with `PoolExhausted` when none frees up.
//! 3. The returned [`PooledConnection`] goes back to the pool when released or
//!    dropped, on every path including errors and cancellation.
//! 4. The health task prunes idle connections past `idle_timeout`, validates
//!    the rest and tops the pool back up to `min_size`.
//! 5. [`ConnectionPool::close`] stops the health task and drops idle
//!    connections.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use geosieve_error::{ErrorCode, ErrorContext, Result, SieveError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolSettings;

/// Creates and validates connections for one target.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Round-trip check used by the health task.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Cheap synchronous check, e.g. whether the socket is already closed.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;

    /// Log-safe description of the target.
    fn target(&self) -> String;
}

struct Idle<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<Idle<C>>,
    /// Open connections, idle or checked out.
    total: usize,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
struct PoolLimits {
    min_size: usize,
    max_size: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    health_check_interval: Duration,
}

impl From<&PoolSettings> for PoolLimits {
    fn from(s: &PoolSettings) -> Self {
        let max_size = s.max_size.max(1);
        Self {
            min_size: s.min_size.min(max_size),
            max_size,
            idle_timeout: s.idle_timeout(),
            acquire_timeout: s.acquire_timeout(),
            health_check_interval: s.health_check_interval(),
        }
    }
}

struct SharedPool<M: ManageConnection> {
    manager: M,
    target: String,
    limits: PoolLimits,
    state: Mutex<PoolState<M::Connection>>,
    /// One permit per checked-out connection.
    slots: Arc<Semaphore>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    created: AtomicU64,
    pruned: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub target: String,
    pub size: usize,
    pub idle: usize,
    pub active: usize,
    pub max_size: usize,
    pub created: u64,
    pub pruned: u64,
    pub timeouts: u64,
}

pub struct ConnectionPool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.shared.target)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Build the pool, opening `min_size` connections. Fails if any of the
    /// initial connections cannot be opened.
    pub async fn connect(manager: M, settings: &PoolSettings) -> Result<Self> {
        let limits = PoolLimits::from(settings);
        let target = manager.target();
        let shared = Arc::new(SharedPool {
            manager,
            target: target.clone(),
            limits,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(limits.max_size),
                total: 0,
                closed: false,
            }),
            slots: Arc::new(Semaphore::new(limits.max_size)),
            reaper: Mutex::new(None),
            created: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        });

        for _ in 0..limits.min_size {
            let conn = shared.open().await?;
            let now = Instant::now();
            let mut state = shared.state.lock();
            state.total += 1;
            state.idle.push_back(Idle {
                conn,
                created_at: now,
                idle_since: now,
            });
        }

        let reaper = tokio::spawn(health_loop(
            Arc::downgrade(&shared),
            limits.health_check_interval,
        ));
        *shared.reaper.lock() = Some(reaper);

        info!(
            target: "pool",
            target_name = %target,
            min_size = limits.min_size,
            max_size = limits.max_size,
            "Connection pool ready"
        );
        Ok(Self { shared })
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        if shared.state.lock().closed {
            return Err(shared.closed_error());
        }

        let permit = match tokio::time::timeout(
            shared.limits.acquire_timeout,
            shared.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(shared.closed_error()),
            Err(_) => {
                shared.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "pool",
                    target_name = %shared.target,
                    timeout = ?shared.limits.acquire_timeout,
                    "Connection pool exhausted"
                );
                return Err(SieveError::new(
                    ErrorCode::PoolExhausted,
                    format!(
                        "No connection to '{}' available within {:?}",
                        shared.target, shared.limits.acquire_timeout
                    ),
                )
                .with_context(shared.error_context())
                .with_hint("Increase pool.max_size or pool.acquire_timeout_ms"));
            }
        };

        // Reuse an idle connection if a healthy one exists.
        loop {
            let candidate = {
                let mut state = shared.state.lock();
                if state.closed {
                    return Err(shared.closed_error());
                }
                state.idle.pop_front()
            };
            let Some(mut idle) = candidate else { break };

            let expired = idle.idle_since.elapsed() > shared.limits.idle_timeout;
            if expired || shared.manager.has_broken(&mut idle.conn) {
                shared.discard(1);
                debug!(target: "pool", target_name = %shared.target, expired, "Discarding idle connection");
                continue;
            }
            return Ok(PooledConnection::new(shared.clone(), idle.conn, idle.created_at, permit));
        }

        let reservation = Reservation::reserve(&shared.state);
        let conn = shared.open().await?;
        reservation.keep();
        Ok(PooledConnection::new(
            shared.clone(),
            conn,
            Instant::now(),
            permit,
        ))
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let state = shared.state.lock();
        PoolStats {
            target: shared.target.clone(),
            size: state.total,
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
            max_size: shared.limits.max_size,
            created: shared.created.load(Ordering::Relaxed),
            pruned: shared.pruned.load(Ordering::Relaxed),
            timeouts: shared.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Run one health pass now instead of waiting for the background task.
    pub async fn run_health_check(&self) {
        self.shared.maintain().await;
    }

    /// Stop the health task and drop every idle connection. Connections that
    /// are checked out are dropped when released.
    pub fn close(&self) {
        let shared = &self.shared;
        let drained = {
            let mut state = shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        shared.slots.close();
        if let Some(handle) = shared.reaper.lock().take() {
            handle.abort();
        }
        info!(
            target: "pool",
            target_name = %shared.target,
            dropped = drained.len(),
            "Connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<M: ManageConnection> SharedPool<M> {
    async fn open(&self) -> Result<M::Connection> {
        let conn = self.manager.connect().await.map_err(|e| {
            warn!(target: "pool", target_name = %self.target, error = %e, "Failed to open connection");
            e
        })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn discard(&self, count: usize) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(count);
        self.pruned.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn closed_error(&self) -> SieveError {
        SieveError::new(
            ErrorCode::PoolClosed,
            format!("Connection pool for '{}' is closed", self.target),
        )
    }

    fn error_context(&self) -> ErrorContext {
        ErrorContext::Connection {
            backend: "relational".to_string(),
            target: self.target.clone(),
            sqlstate: None,
        }
    }

    fn checkin(&self, conn: M::Connection, created_at: Instant, broken: bool) {
        let mut state = self.state.lock();
        if broken || state.closed {
            state.total = state.total.saturating_sub(1);
            if broken {
                self.pruned.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        state.idle.push_back(Idle {
            conn,
            created_at,
            idle_since: Instant::now(),
        });
    }

    /// One health pass: prune, validate, replenish.
    async fn maintain(&self) {
        let limits = self.limits;

        // Take idle connections out while holding a slot for each, so the
        // pool never exceeds max_size while they are being checked.
        let mut checking = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            while let Some(idle) = state.idle.pop_front() {
                match self.slots.clone().try_acquire_owned() {
                    Ok(permit) => checking.push((idle, permit)),
                    Err(_) => {
                        state.idle.push_front(idle);
                        break;
                    }
                }
            }
        }

        let mut pruned = 0;
        for (mut idle, permit) in checking {
            let over_min = self.state.lock().total > limits.min_size;
            if over_min && idle.idle_since.elapsed() > limits.idle_timeout {
                self.discard(1);
                pruned += 1;
                drop(permit);
                continue;
            }
            match self.manager.is_valid(&mut idle.conn).await {
                Ok(()) => {
                    self.state.lock().idle.push_back(idle);
                }
                Err(e) => {
                    debug!(target: "pool", target_name = %self.target, error = %e, "Health check failed");
                    self.discard(1);
                    pruned += 1;
                }
            }
            drop(permit);
        }

        let mut replenished = 0;
        loop {
            {
                let state = self.state.lock();
                if state.closed || state.total >= limits.min_size {
                    break;
                }
            }
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let reservation = Reservation::reserve(&self.state);
            match self.open().await {
                Ok(conn) => {
                    reservation.keep();
                    self.checkin(conn, Instant::now(), false);
                    replenished += 1;
                }
                Err(_) => {
                    drop(reservation);
                    drop(permit);
                    break;
                }
            }
            drop(permit);
        }

        if pruned > 0 || replenished > 0 {
            info!(
                target: "pool",
                target_name = %self.target,
                pruned,
                replenished,
                "Connection pool health check"
            );
        }
    }
}

/// Counts a connection that is still being opened. Dropped without
/// [`keep`](Self::keep), e.g. when the opening task is cancelled, it takes
/// the count back.
struct Reservation<'a, C> {
    state: &'a Mutex<PoolState<C>>,
    armed: bool,
}

impl<'a, C> Reservation<'a, C> {
    fn reserve(state: &'a Mutex<PoolState<C>>) -> Self {
        state.lock().total += 1;
        Self { state, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
        }
    }
}

async fn health_loop<M: ManageConnection>(pool: Weak<SharedPool<M>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = pool.upgrade() else { break };
        shared.maintain().await;
    }
}

/// A checked-out connection. Returned to the pool on release or drop.
pub struct PooledConnection<M: ManageConnection> {
    pool: Arc<SharedPool<M>>,
    conn: Option<M::Connection>,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(
        pool: Arc<SharedPool<M>>,
        conn: M::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            conn: Some(conn),
            created_at,
            permit: Some(permit),
            broken: false,
        }
    }

    /// Do not return this connection to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Hand the connection back now. Dropping the guard does the same.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, self.created_at, self.broken);
        }
        // Slot is freed only after the connection is back in the idle list.
        self.permit.take();
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection is present until the guard is released")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection is present until the guard is released")
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.target)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

type PoolCell<M> = Arc<OnceCell<ConnectionPool<M>>>;

/// One pool per connection target, created on first use.
///
/// Pools are built outside the registry lock: a slow or unreachable target
/// only holds up callers asking for that same target.
pub struct PoolRegistry<M: ManageConnection> {
    settings: PoolSettings,
    pools: Mutex<HashMap<String, PoolCell<M>>>,
}

impl<M: ManageConnection> PoolRegistry<M> {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Return the pool for `key`, building it with `make_manager` if needed.
    /// A failed build leaves nothing registered, so the next call retries.
    pub async fn get_or_connect<F>(&self, key: &str, make_manager: F) -> Result<ConnectionPool<M>>
    where
        F: FnOnce() -> Result<M>,
    {
        let cell = {
            let mut pools = self.pools.lock();
            let cell = pools.entry(key.to_string()).or_default();
            if cell.get().is_some_and(|pool| pool.is_closed()) {
                *cell = Arc::default();
            }
            cell.clone()
        };
        let pool = cell
            .get_or_try_init(|| async {
                ConnectionPool::connect(make_manager()?, &self.settings).await
            })
            .await?;
        Ok(pool.clone())
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.lock();
        let mut stats: Vec<_> = pools
            .values()
            .filter_map(|cell| cell.get())
            .map(|pool| pool.stats())
            .collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self.pools.lock().drain().collect();
        for (_, cell) in drained {
            if let Some(pool) = cell.get() {
                pool.close();
            }
        }
    }
}
