//! Bounded async connection pool.
//!
//! A lease holds one semaphore permit, so at most `max_size` connections are
//! ever leased at once. New connections are only opened when no idle one is
//! available, which keeps the total number of open connections within
//! `max_size` as well.
//!
//! ```text
//!             acquire()                 release() / drop
//!   [idle] ──────────────► [leased] ─────────────────────► [idle]
//!     │  liveness probe fails   │ invalidate()
//!     └──────────► [invalid] ◄──┘      (closed, slot freed)
//! ```
//!
//! Idle connections are reused LIFO so cold ones age out at the front of the
//! queue, where the reaper closes them once they pass `idle_timeout`.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Creates and health-checks connections for a [`Pool`].
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    ///
    /// # Errors
    /// Returns `Err` if the service is unreachable or refuses the connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Cheap liveness probe run before an idle connection is leased.
    fn is_valid(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send;
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle and leased.
    pub size: usize,
    /// Idle connections ready to lease.
    pub available: usize,
    pub leased: usize,
    /// Callers currently waiting for a slot.
    pub pending: usize,
    pub max_size: usize,
    pub created: u64,
    pub discarded: u64,
    pub timeouts: u64,
}

struct IdleConn<C> {
    conn: C,
    idle_since: Instant,
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<M::Connection>>>,
    slots: Arc<Semaphore>,
    size: AtomicUsize,
    pending: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
    closed: AtomicBool,
}

impl<M: ManageConnection> Shared<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConn<M::Connection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn discard(&self, conn: M::Connection) {
        drop(conn);
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn put_back(&self, conn: M::Connection) {
        if self.closed.load(Ordering::SeqCst) {
            self.discard(conn);
            return;
        }
        self.idle().push_back(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Close expired idle connections without dropping below `min_size`.
    fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<M::Connection> = {
            let mut idle = self.idle();
            let mut removable = self
                .size
                .load(Ordering::SeqCst)
                .saturating_sub(self.config.min_size);
            let mut expired = Vec::new();
            while removable > 0 {
                match idle.front() {
                    Some(front)
                        if now.saturating_duration_since(front.idle_since)
                            >= self.config.idle_timeout =>
                    {
                        if let Some(entry) = idle.pop_front() {
                            expired.push(entry.conn);
                        }
                        removable -= 1;
                    }
                    _ => break,
                }
            }
            expired
        };

        let count = expired.len();
        for conn in expired {
            self.discard(conn);
        }
        if count > 0 {
            debug!("✓ Pool reaped {} idle connection(s)", count);
        }
        count
    }
}

/// Decrements the pending-waiter gauge even if the acquiring future is dropped.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        PendingGuard(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of reusable connections.
///
/// Cheap to clone; clones share the same connections.
pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create an empty pool. No connection is opened until `acquire` or
    /// [`fill_min`](Self::fill_min).
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let permits = config.max_size.max(1);
        Pool {
            shared: Arc::new(Shared {
                manager,
                slots: Arc::new(Semaphore::new(permits)),
                config,
                idle: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a pool and open `min_size` connections up front.
    ///
    /// Connection failures are logged, not returned: a cache service that is
    /// down at startup must not keep the process from starting.
    pub async fn build(manager: M, config: PoolConfig) -> Self {
        let pool = Pool::new(manager, config);
        let opened = pool.fill_min().await;
        info!(
            "✓ Connection pool ready ({} of min {} connections, max {})",
            opened, pool.shared.config.min_size, pool.shared.config.max_size
        );
        pool
    }

    /// Open connections until `min_size` exist. Returns how many were opened.
    pub async fn fill_min(&self) -> usize {
        let shared = &self.shared;
        let mut opened = 0;
        while shared.size.load(Ordering::SeqCst) < shared.config.min_size {
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            let attempt =
                tokio::time::timeout(shared.config.acquire_timeout, shared.manager.connect()).await;
            match attempt {
                Ok(Ok(conn)) => {
                    shared.size.fetch_add(1, Ordering::SeqCst);
                    shared.created.fetch_add(1, Ordering::Relaxed);
                    shared.put_back(conn);
                    opened += 1;
                }
                Ok(Err(e)) => {
                    warn!("Pool pre-fill connection failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(
                        "Pool pre-fill connection timed out after {:?}",
                        shared.config.acquire_timeout
                    );
                    break;
                }
            }
        }
        opened
    }

    /// Lease a connection.
    ///
    /// Reuses a validated idle connection when one exists, opens a new one
    /// below `max_size`, and otherwise waits for a release. The whole call,
    /// including probing and connecting, is bounded by `acquire_timeout`.
    ///
    /// # Errors
    /// - `Error::PoolTimeout` if no connection was obtained in time
    /// - `Error::PoolClosed` if the pool was closed
    /// - the manager's connect error if opening a new connection failed
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        let timeout = shared.config.acquire_timeout;
        let deadline = Instant::now() + timeout;

        let permit = {
            let _pending = PendingGuard::enter(&shared.pending);
            tokio::time::timeout_at(deadline, Arc::clone(&shared.slots).acquire_owned()).await
        };
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                shared.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("Pool exhausted: no connection within {:?}", timeout);
                return Err(Error::PoolTimeout(format!(
                    "no connection available within {:?}",
                    timeout
                )));
            }
        };

        loop {
            let candidate = shared.idle().pop_back();
            let Some(IdleConn {
                mut conn,
                idle_since,
            }) = candidate
            else {
                break;
            };

            if idle_since.elapsed() >= shared.config.idle_timeout {
                shared.discard(conn);
                continue;
            }
            match tokio::time::timeout_at(deadline, shared.manager.is_valid(&mut conn)).await {
                Ok(true) => return Ok(PooledConnection::new(conn, permit, Arc::clone(shared))),
                _ => {
                    debug!("Discarding connection that failed its liveness probe");
                    shared.discard(conn);
                }
            }
        }

        match tokio::time::timeout_at(deadline, shared.manager.connect()).await {
            Ok(Ok(conn)) => {
                shared.size.fetch_add(1, Ordering::SeqCst);
                shared.created.fetch_add(1, Ordering::Relaxed);
                debug!("✓ Pool opened connection ({} open)", shared.size.load(Ordering::SeqCst));
                Ok(PooledConnection::new(conn, permit, Arc::clone(shared)))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                shared.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::PoolTimeout(format!(
                    "connect did not complete within {:?}",
                    timeout
                )))
            }
        }
    }

    /// Return a leased connection to the idle set.
    pub fn release(&self, conn: PooledConnection<M>) {
        conn.release();
    }

    /// Close a leased connection instead of returning it.
    pub fn invalidate(&self, conn: PooledConnection<M>) {
        conn.invalidate();
    }

    /// Close idle connections older than `idle_timeout`, keeping `min_size`.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap()
    }

    /// Run [`reap_idle`](Self::reap_idle) every `reap_interval` until the pool
    /// is closed or dropped.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let weak: Weak<Shared<M>> = Arc::downgrade(&self.shared);
        let period = self.shared.config.reap_interval.max(std::time::Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                shared.reap();
            }
        })
    }

    /// Close the pool: wake waiters with `PoolClosed` and drop idle connections.
    /// Leased connections are closed when they come back.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.slots.close();
        let drained: Vec<IdleConn<M::Connection>> = shared.idle().drain(..).collect();
        for entry in drained {
            shared.discard(entry.conn);
        }
        info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let size = shared.size.load(Ordering::SeqCst);
        let available = shared.idle().len();
        PoolStats {
            size,
            available,
            leased: size.saturating_sub(available),
            pending: shared.pending.load(Ordering::SeqCst),
            max_size: shared.config.max_size,
            created: shared.created.load(Ordering::Relaxed),
            discarded: shared.discarded.load(Ordering::Relaxed),
            timeouts: shared.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A leased connection. Returned to the pool when dropped.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(conn: M::Connection, permit: OwnedSemaphorePermit, shared: Arc<Shared<M>>) -> Self {
        PooledConnection {
            conn: Some(conn),
            shared,
            _permit: permit,
        }
    }

    /// Return the connection to the idle set.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection and free its slot.
    pub fn invalidate(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.discard(conn);
        }
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // only None after invalidate(), which consumes self
        self.conn.as_ref().unwrap_or_else(|| unreachable!("leased connection taken"))
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("leased connection taken"))
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.put_back(conn);
        }
    }
}
