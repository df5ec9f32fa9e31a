//! Bounded pool of reusable upstream connections
//!
//! The pool never blocks. [`ConnectionPool::acquire`] answers immediately with
//! an idle connection, a [`Reservation`] to create a new one, or
//! [`Acquire::Blocked`] when every connection slot is taken. Waiting is the
//! caller's business.
//!
//! Connections leave the pool inside a [`Lease`]; a lease that is dropped
//! without being released discards its connection, so every connection slot
//! is given back exactly once.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ManagerConfig;

/// Unique identifier for a connection
pub type ConnectionId = u64;

/// Configuration for connection pool behavior
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum connections in existence (idle + lent)
    pub max_connections: usize,

    /// Maximum idle connections kept for reuse
    pub max_pool_size: usize,

    /// Idle age after which a connection is evicted
    pub connection_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_pool_size: 5,
            connection_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&ManagerConfig> for PoolConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_pool_size: config.max_pool_size,
            connection_ttl: config.connection_ttl(),
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections in existence, idle or lent (including reserved slots)
    pub active_connections: usize,

    /// Idle connections ready for reuse
    pub idle_connections: usize,

    /// Idle connections that were established by warmup
    pub warm_idle_connections: usize,

    /// Total connections created
    pub total_created: u64,

    /// Total connections reused from the idle set
    pub total_reused: u64,

    /// Connections dropped on release (pool full) or after a fault
    pub total_discarded: u64,

    /// Idle connections removed by the TTL sweep
    pub total_evicted: u64,

    /// Reserved slots given back without a connection being created
    pub failed_attempts: u64,
}

/// A pooled upstream connection
pub struct Connection<H> {
    id: ConnectionId,
    handle: H,
    created_at: Instant,
    last_used_at: Instant,
    is_warm: bool,
    request_count: u64,
}

impl<H> Connection<H> {
    fn new(id: ConnectionId, handle: H, is_warm: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            created_at: now,
            last_used_at: now,
            is_warm,
            request_count: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Whether warmup established this connection
    pub fn is_warm(&self) -> bool {
        self.is_warm
    }

    /// Number of requests issued through this connection
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Get the underlying handle
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Mark connection as used by a request
    pub fn mark_used(&mut self) {
        self.request_count += 1;
        self.last_used_at = Instant::now();
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_used_at) >= ttl
    }
}

impl<H> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("is_warm", &self.is_warm)
            .field("request_count", &self.request_count)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

/// Outcome of [`ConnectionPool::acquire`]
pub enum Acquire<H> {
    /// An idle connection taken from the pool
    Idle(Lease<H>),

    /// No idle connection, but a slot was reserved for a new one
    Create(Reservation<H>),

    /// Every connection slot is in use
    Blocked,
}

impl<H> fmt::Debug for Acquire<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acquire::Idle(lease) => f.debug_tuple("Idle").field(&lease.id()).finish(),
            Acquire::Create(_) => f.write_str("Create"),
            Acquire::Blocked => f.write_str("Blocked"),
        }
    }
}

struct PoolState<H> {
    /// Idle connections, least recently used at the front
    idle: VecDeque<Connection<H>>,

    /// Connections in existence plus reserved slots
    active: usize,

    next_id: ConnectionId,

    /// Set by `close()`; releases discard from then on
    closed: bool,

    stats: PoolStats,
}

struct PoolInner<H> {
    config: PoolConfig,
    state: Mutex<PoolState<H>>,

    /// Signalled whenever a connection slot or idle connection frees up
    released: Notify,

    /// Signalled when user traffic found every slot taken
    slot_wanted: Notify,
}

/// Connection pool
pub struct ConnectionPool<H> {
    inner: Arc<PoolInner<H>>,
}

impl<H> Clone for ConnectionPool<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H> ConnectionPool<H> {
    /// Create a new, empty connection pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max_pool_size),
                    active: 0,
                    next_id: 0,
                    closed: false,
                    stats: PoolStats::default(),
                }),
                released: Notify::new(),
                slot_wanted: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get an idle connection, reserve a slot for a new one, or report exhaustion
    pub fn acquire(&self) -> Acquire<H> {
        self.acquire_where(|_| true)
    }

    /// Like [`acquire`](Self::acquire), discarding idle connections whose
    /// handle fails `is_reusable` instead of lending them out
    pub fn acquire_where<F>(&self, is_reusable: F) -> Acquire<H>
    where
        F: Fn(&H) -> bool,
    {
        let mut stale = Vec::new();
        let acquired = {
            let mut state = self.inner.state.lock();
            self.acquire_locked(&mut state, &is_reusable, &mut stale)
        };

        if !stale.is_empty() {
            debug!(discarded = stale.len(), "Discarded dead idle connections");
            drop(stale);
            self.inner.released.notify_waiters();
        }

        acquired
    }

    fn acquire_locked<F>(&self, state: &mut PoolState<H>, is_reusable: &F, stale: &mut Vec<Connection<H>>) -> Acquire<H>
    where
        F: Fn(&H) -> bool,
    {
        while let Some(conn) = state.idle.pop_back() {
            if !is_reusable(&conn.handle) {
                state.active = state.active.saturating_sub(1);
                state.stats.total_discarded += 1;
                stale.push(conn);
                continue;
            }

            state.stats.total_reused += 1;
            debug!(
                conn_id = conn.id,
                use_count = conn.request_count,
                age_secs = conn.created_at.elapsed().as_secs(),
                "Reusing connection"
            );
            return Acquire::Idle(Lease::new(self.clone(), conn));
        }

        match self.reserve_locked(state) {
            Some(reservation) => Acquire::Create(reservation),
            None => Acquire::Blocked,
        }
    }

    /// Reserve a slot for a new connection without touching the idle set
    pub fn try_reserve(&self) -> Option<Reservation<H>> {
        let mut state = self.inner.state.lock();
        self.reserve_locked(&mut state)
    }

    fn reserve_locked(&self, state: &mut PoolState<H>) -> Option<Reservation<H>> {
        if state.closed || state.active >= self.inner.config.max_connections {
            return None;
        }
        state.active += 1;
        state.next_id += 1;
        Some(Reservation {
            pool: self.clone(),
            id: state.next_id,
            fulfilled: false,
        })
    }

    /// Return a connection to the idle set, or discard it when the pool is full
    pub fn release(&self, mut conn: Connection<H>) {
        let mut state = self.inner.state.lock();

        if !state.closed && state.idle.len() < self.inner.config.max_pool_size {
            conn.last_used_at = Instant::now();
            state.idle.push_back(conn);
        } else {
            debug!(conn_id = conn.id, "Pool full, discarding connection");
            state.active = state.active.saturating_sub(1);
            state.stats.total_discarded += 1;
        }
        drop(state);

        self.inner.released.notify_waiters();
    }

    /// Free the slot of a lent connection that is not coming back
    fn free_slot(&self, conn_id: ConnectionId) {
        debug!(conn_id, "Discarding connection");
        {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.stats.total_discarded += 1;
        }
        self.inner.released.notify_waiters();
    }

    /// Remove idle connections unused for at least `ttl`
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: VecDeque<Connection<H>> = {
            let mut state = self.inner.state.lock();
            let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|conn| !conn.is_expired(now, ttl));
            state.idle = keep;
            state.active = state.active.saturating_sub(expired.len());
            state.stats.total_evicted += expired.len() as u64;
            expired
        };

        if !expired.is_empty() {
            debug!(
                removed = expired.len(),
                ttl_secs = ttl.as_secs(),
                "Evicted expired idle connections"
            );
            self.inner.released.notify_waiters();
        }

        expired.len()
    }

    /// Drop all idle connections and refuse to pool any further ones
    pub fn close(&self) -> usize {
        let drained: Vec<Connection<H>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.active = state.active.saturating_sub(drained.len());
            drained
        };

        info!(closed = drained.len(), "Closed idle connections");
        self.inner.released.notify_waiters();
        drained.len()
    }

    /// Future resolving the next time a slot or idle connection frees up.
    ///
    /// Create (and `enable`) it before calling [`acquire`](Self::acquire) to
    /// avoid missing a release in between.
    pub fn released(&self) -> Notified<'_> {
        self.inner.released.notified()
    }

    /// Tell background work holding slots that user traffic is waiting for one
    pub fn request_slot(&self) {
        self.inner.slot_wanted.notify_waiters();
    }

    /// Future resolving on the next [`request_slot`](Self::request_slot).
    ///
    /// Create (and `enable`) it before reserving a slot.
    pub fn slot_wanted(&self) -> Notified<'_> {
        self.inner.slot_wanted.notified()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.active_connections = state.active;
        stats.idle_connections = state.idle.len();
        stats.warm_idle_connections = state.idle.iter().filter(|c| c.is_warm).count();
        stats
    }
}

/// A reserved connection slot.
///
/// Fulfil it with a freshly created handle, or drop it to give the slot back.
#[must_use = "dropping a reservation gives the slot back"]
pub struct Reservation<H> {
    pool: ConnectionPool<H>,
    id: ConnectionId,
    fulfilled: bool,
}

impl<H> Reservation<H> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Turn the slot into a lent connection
    pub fn fulfill(mut self, handle: H, is_warm: bool) -> Lease<H> {
        self.fulfilled = true;
        self.pool.inner.state.lock().stats.total_created += 1;
        debug!(conn_id = self.id, is_warm, "Created new connection");
        Lease::new(self.pool.clone(), Connection::new(self.id, handle, is_warm))
    }
}

impl<H> Drop for Reservation<H> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        {
            let mut state = self.pool.inner.state.lock();
            state.active = state.active.saturating_sub(1);
            state.stats.failed_attempts += 1;
        }
        self.pool.inner.released.notify_waiters();
    }
}

/// A connection lent to exactly one caller.
///
/// Dropping a lease without calling [`release`](Self::release) discards the
/// connection and frees its slot.
pub struct Lease<H> {
    conn: Connection<H>,
    slot: LeasedSlot<H>,
}

/// Frees a lent connection's slot unless the connection went back to the pool
struct LeasedSlot<H> {
    pool: ConnectionPool<H>,
    conn_id: ConnectionId,
    returned: bool,
}

impl<H> Lease<H> {
    fn new(pool: ConnectionPool<H>, conn: Connection<H>) -> Self {
        let conn_id = conn.id;
        Self {
            conn,
            slot: LeasedSlot {
                pool,
                conn_id,
                returned: false,
            },
        }
    }

    /// Give the connection back to the pool
    pub fn release(self) {
        let Lease { conn, mut slot } = self;
        slot.returned = true;
        slot.pool.release(conn);
    }

    /// Drop the connection instead of pooling it
    pub fn discard(self) {
        debug!(
            conn_id = self.conn.id,
            requests = self.conn.request_count,
            "Connection will not be reused"
        );
    }
}

impl<H> Deref for Lease<H> {
    type Target = Connection<H>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<H> DerefMut for Lease<H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl<H> Drop for LeasedSlot<H> {
    fn drop(&mut self) {
        if !self.returned {
            self.pool.free_slot(self.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_connections: usize, max_pool_size: usize) -> ConnectionPool<u32> {
        ConnectionPool::new(PoolConfig {
            max_connections,
            max_pool_size,
            connection_ttl: Duration::from_secs(60),
        })
    }

    fn create(pool: &ConnectionPool<u32>, handle: u32) -> Lease<u32> {
        match pool.acquire() {
            Acquire::Create(reservation) => reservation.fulfill(handle, false),
            other => panic!("expected a reservation, got {:?}", other),
        }
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_pool_size, 5);
    }

    #[test]
    fn test_acquire_creates_up_to_max_then_blocks() {
        let pool = pool(2, 2);
        let first = create(&pool, 1);
        let second = create(&pool, 2);

        assert!(matches!(pool.acquire(), Acquire::Blocked));
        assert_eq!(pool.active_connections(), 2);

        first.release();
        match pool.acquire() {
            Acquire::Idle(lease) => assert_eq!(lease.id(), 1),
            other => panic!("expected idle connection, got {:?}", other),
        }
        drop(second);
    }

    #[test]
    fn test_release_discards_when_pool_full() {
        let pool = pool(3, 1);
        let a = create(&pool, 1);
        let b = create(&pool, 2);

        a.release();
        b.release();

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_discarded, 1);
    }

    #[test]
    fn test_dropped_lease_and_reservation_free_slots() {
        let pool = pool(1, 1);
        let lease = create(&pool, 7);
        drop(lease);
        assert_eq!(pool.active_connections(), 0);

        let reservation = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());
        drop(reservation);

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.failed_attempts, 1);
    }

    #[test]
    fn test_handle_use_is_counted() {
        let pool = pool(1, 1);
        let mut lease = create(&pool, 3);
        lease.mark_used();
        assert_eq!(*lease.handle_mut(), 3);
        assert_eq!(lease.request_count(), 1);
        lease.release();

        match pool.acquire() {
            Acquire::Idle(lease) => assert_eq!(lease.request_count(), 1),
            other => panic!("expected idle connection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let pool = pool(3, 3);
        let old = create(&pool, 1);
        let fresh = create(&pool, 2);
        old.release();

        tokio::time::advance(Duration::from_secs(30)).await;
        fresh.release();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.evict_expired(Duration::from_secs(60)), 1);

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_evicted, 1);
    }

    #[test]
    fn test_close_discards_idle_and_future_releases() {
        let pool = pool(2, 2);
        let a = create(&pool, 1);
        let b = create(&pool, 2);
        a.release();

        assert_eq!(pool.close(), 1);
        b.release();

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 0);
        assert!(pool.try_reserve().is_none());
    }

    #[test]
    fn test_dead_idle_connections_are_skipped() {
        let pool = pool(3, 3);
        let a = create(&pool, 1);
        let b = create(&pool, 2);
        a.release();
        b.release();

        // Odd handles are dead
        let kept = match pool.acquire_where(|h| h % 2 == 0) {
            Acquire::Idle(lease) => lease,
            other => panic!("expected idle connection, got {:?}", other),
        };
        assert_eq!(*kept.handle(), 2);
        match pool.acquire_where(|h| h % 2 == 0) {
            Acquire::Create(_) => {}
            other => panic!("expected a reservation, got {:?}", other),
        }

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_discarded, 1);
        assert_eq!(stats.total_reused, 1);
    }

    #[test]
    fn test_warm_connections_are_reported() {
        let pool = pool(2, 2);
        let reservation = pool.try_reserve().unwrap();
        reservation.fulfill(9, true).release();

        assert_eq!(pool.stats().warm_idle_connections, 1);
    }
}
