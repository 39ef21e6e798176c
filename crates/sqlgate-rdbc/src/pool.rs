//! Connection pool for sqlgate-rdbc
//!
//! A bounded pool of connections to one target:
//! - Lazy: constructing a pool opens nothing; connections open on first borrow
//! - Semaphore-bounded checkout with an acquire timeout
//! - Health checking and lifetime/idle recycling on borrow
//! - Explicit, awaited retirement that drains in-flight borrows
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlgate_rdbc::prelude::*;
//! use sqlgate_rdbc::postgres::PgConnectionFactory;
//! use std::sync::Arc;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(10),
//!     Arc::new(PgConnectionFactory),
//! );
//!
//! let conn = pool.get().await?;
//! conn.execute("SELECT 1", &[]).await?;
//! conn.release().await;
//!
//! pool.retire().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_connection(ConnectionConfig::new(url))
    }

    /// Create pool config around an existing connection configuration
    pub fn from_connection(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(600),  // 10 minutes
            test_on_borrow: true,
        }
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of successful borrows
    pub acquisitions: u64,
    /// Number of times a borrow timed out
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Bounded connection pool for one target.
///
/// Checkout is bounded by a semaphore with one permit per connection slot.
/// A borrowed connection holds its permit until it is released or
/// discarded, so [`retire`](Self::retire) can wait for every slot to come
/// back before closing.
pub struct ConnectionPool {
    /// Pool configuration
    config: PoolConfig,
    /// Connection factory
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO for better cache locality)
    idle: Mutex<Vec<PoolEntry>>,
    /// One permit per connection slot
    semaphore: Arc<Semaphore>,
    /// Current total connection count
    total_connections: AtomicUsize,
    /// Statistics
    stats: AtomicPoolStats,
    /// Set once retirement begins; no borrows after that
    closed: AtomicBool,
    /// Completes when retirement has drained the pool
    retired: OnceCell<()>,
}

/// Internal pool entry with metadata
struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connection", &self.config.connection)
            .field("max_size", &self.config.max_size)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a new connection pool. Opens no connections.
    ///
    /// A `max_size` of zero is raised to one.
    pub fn new(mut config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        config.max_size = config.max_size.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::new(),
            closed: AtomicBool::new(false),
            retired: OnceCell::new(),
        })
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get current number of open connections (idle and borrowed)
    pub fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Get number of free borrow slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Whether retirement has begun
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection, waiting up to the acquire timeout for a slot.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_exhausted();
            Error::PoolExhausted {
                message: format!(
                    "no connection available within {}ms (max {})",
                    self.config.acquire_timeout.as_millis(),
                    self.config.max_size
                ),
            }
        })?
        .map_err(|_| Error::PoolClosed)?;

        // retirement may have started while this borrow was queued
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let entry = match self.take_idle().await {
            Some(entry) => entry,
            None => {
                // permit drops with the error, freeing the slot
                let conn = self.create_connection().await?;
                let now = Instant::now();
                PoolEntry {
                    conn,
                    created_at: now,
                    last_used: now,
                }
            }
        };

        let wait_ms = start.elapsed().as_millis() as u64;
        self.stats.record_acquisition(wait_ms);

        Ok(PooledConnection {
            conn: Some(entry.conn),
            created_at: entry.created_at,
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    /// Retire the pool: refuse new borrows, wait for every borrowed
    /// connection to come back, then close all connections.
    ///
    /// Idempotent; concurrent callers all wait for the same drain.
    pub async fn retire(&self) {
        self.retired
            .get_or_init(|| async {
                self.closed.store(true, Ordering::Release);
                self.close_idle().await;

                let slots = u32::try_from(self.config.max_size).unwrap_or(u32::MAX);
                match self.semaphore.acquire_many(slots).await {
                    Ok(permits) => {
                        // every slot is back; anything that slipped into idle closes now
                        self.close_idle().await;
                        self.semaphore.close();
                        drop(permits);
                    }
                    Err(_) => self.close_idle().await,
                }

                debug!(
                    stats = ?self.stats.snapshot(),
                    avg_wait_ms = self.stats.avg_wait_time_ms(),
                    "connection pool retired"
                );
            })
            .await;
    }

    /// Pop the most recently used healthy idle connection, closing stale ones.
    async fn take_idle(&self) -> Option<PoolEntry> {
        loop {
            let entry = self.idle.lock().await.pop()?;

            if self.should_recycle(&entry) {
                self.close_entry(entry.conn).await;
                continue;
            }

            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                self.stats.record_health_check_failure();
                self.close_entry(entry.conn).await;
                continue;
            }

            return Some(entry);
        }
    }

    /// Create a new connection using the factory
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        Ok(conn)
    }

    /// Check if a connection should be recycled (expired)
    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        if self.is_closed() {
            self.close_entry(conn).await;
            return;
        }

        self.idle.lock().await.push(PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        });
    }

    async fn close_entry(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            warn!(error = %e, "error closing pooled connection");
        }
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    async fn close_idle(&self) {
        let drained: Vec<PoolEntry> = self.idle.lock().await.drain(..).collect();
        for entry in drained {
            self.close_entry(entry.conn).await;
        }
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Give it back with [`release`](Self::release), or [`discard`](Self::discard)
/// it when its session state is unknown. A borrow dropped without either,
/// such as one abandoned by a cancelled call, may still hold an open
/// transaction, so it is closed on a spawned task instead of being reused.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<ConnectionPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Return the connection to the pool for reuse
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.created_at).await;
        }
        self.permit.take();
    }

    /// Close the connection instead of returning it
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.close_entry(conn).await;
        }
        self.permit.take();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn.as_ref(),
            // conn is only taken by release/discard, which consume self
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("borrow dropped without release; closing connection");
                handle.spawn(async move {
                    pool.close_entry(conn).await;
                    drop(permit);
                });
            }
            Err(_) => {
                pool.total_connections.fetch_sub(1, Ordering::Release);
                pool.stats.record_closed();
            }
        }
    }
}
