//! Raw connection pool.
//!
//! [`RawPool`] is the boundary the facade drives: counters, acquire/release,
//! a removal notification channel and idle termination. [`ManagedPool`] is the
//! implementation used in practice; it opens physical connections through a
//! [`Connector`] and never exceeds its connection limit.
//!
//! # Accounting
//!
//! - `total` counts idle connections, checked-out connections and slots whose
//!   connection is still being opened.
//! - Semaphore permits track checked-out connections only. A permit is taken
//!   (and forgotten) on acquire and handed back on release or discard, so idle
//!   connections hold no permit. New connections are opened only when no idle
//!   connection exists, which keeps `total <= max_connections`.
//! - The semaphore is fair, so waiting callers are served in FIFO order.
//! - Every teardown (discard, idle termination, failed open) decrements `total`
//!   *before* broadcasting [`ConnectionRemoved`], so a subscriber that re-reads
//!   the counters after a notification always sees the post-removal state.

use crate::db::executor::ConnectionExecutor;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Capacity of the removal notification channel.
const REMOVAL_CHANNEL_CAPACITY: usize = 64;

/// Notification fired once per physical connection torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRemoved {
    pub connection_id: u64,
}

/// Opens physical connections for a [`ManagedPool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: ConnectionExecutor;

    async fn connect(&self) -> DbResult<Self::Connection>;
}

/// A physical connection tagged with its pool-assigned id.
#[derive(Debug)]
pub struct PhysicalConnection<C> {
    id: u64,
    conn: C,
}

impl<C> PhysicalConnection<C> {
    pub fn new(id: u64, conn: C) -> Self {
        Self { id, conn }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C> Deref for PhysicalConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PhysicalConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

/// Pool boundary used by the facade.
#[async_trait]
pub trait RawPool: Send + Sync + 'static {
    type Connection: ConnectionExecutor;

    /// Connections owned by the pool: idle, checked out, or being opened.
    fn total_count(&self) -> usize;

    fn idle_count(&self) -> usize;

    /// Callers queued for a connection.
    fn waiting_count(&self) -> usize;

    /// Check out a connection, waiting for one to become available if needed.
    async fn acquire(&self) -> DbResult<PhysicalConnection<Self::Connection>>;

    /// Return a checked-out connection to the idle set.
    fn release(&self, conn: PhysicalConnection<Self::Connection>);

    /// Tear down a checked-out connection instead of returning it.
    fn discard(&self, conn: PhysicalConnection<Self::Connection>);

    /// Subscribe to removal notifications.
    fn subscribe_removals(&self) -> broadcast::Receiver<ConnectionRemoved>;

    /// Tear down every idle connection. Returns how many were removed.
    fn terminate_idle(&self) -> usize;

    /// Stop handing out connections. Queued and later `acquire` calls fail
    /// with [`DbError::PoolShuttingDown`]; release and discard keep working.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

struct PoolState<T> {
    idle: VecDeque<PhysicalConnection<T>>,
    total: usize,
}

/// FIFO connection pool over a [`Connector`].
pub struct ManagedPool<C: Connector> {
    connector: C,
    state: Mutex<PoolState<C::Connection>>,
    semaphore: Semaphore,
    waiting: AtomicUsize,
    next_id: AtomicU64,
    removals: broadcast::Sender<ConnectionRemoved>,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl<C: Connector> ManagedPool<C> {
    pub fn new(connector: C, max_connections: u32, acquire_timeout: Duration) -> Self {
        let (removals, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
            }),
            semaphore: Semaphore::new(max_connections as usize),
            waiting: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            removals,
            max_connections,
            acquire_timeout,
        }
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_removed(&self, connection_id: u64) {
        // No subscribers is the common case outside of shutdown.
        let _ = self.removals.send(ConnectionRemoved { connection_id });
    }

    /// Close a connection that has already been removed from the accounting.
    fn dispose(&self, conn: PhysicalConnection<C::Connection>) {
        let id = conn.id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.into_inner().close().await {
                        debug!(connection_id = id, error = %e, "Error closing connection");
                    }
                });
            }
            Err(_) => drop(conn),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ManagedPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ManagedPool")
            .field("total", &state.total)
            .field("idle", &state.idle.len())
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

/// Counts a caller as waiting for as long as it is alive.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A reserved slot whose connection is being opened.
///
/// Dropping an armed slot (open failed or the caller went away) gives the
/// slot back and reports it as removed.
struct OpeningSlot<'a, C: Connector> {
    pool: &'a ManagedPool<C>,
    id: u64,
    armed: bool,
}

impl<C: Connector> OpeningSlot<'_, C> {
    fn fill(mut self, conn: C::Connection) -> PhysicalConnection<C::Connection> {
        self.armed = false;
        PhysicalConnection::new(self.id, conn)
    }
}

impl<C: Connector> Drop for OpeningSlot<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.lock_state();
            state.total = state.total.saturating_sub(1);
        }
        self.pool.semaphore.add_permits(1);
        self.pool.notify_removed(self.id);
    }
}

#[async_trait]
impl<C: Connector> RawPool for ManagedPool<C> {
    type Connection = C::Connection;

    fn total_count(&self) -> usize {
        self.lock_state().total
    }

    fn idle_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    async fn acquire(&self) -> DbResult<PhysicalConnection<C::Connection>> {
        let permit = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            match timeout(self.acquire_timeout, self.semaphore.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::PoolShuttingDown),
                Err(_) => {
                    return Err(DbError::timeout(
                        "connection pool acquire",
                        self.acquire_timeout,
                    ));
                }
            }
        };
        // close() may have raced the wakeup; never open a connection after it.
        if self.semaphore.is_closed() {
            return Err(DbError::PoolShuttingDown);
        }
        // The permit now belongs to the checked-out connection.
        permit.forget();

        let reused = {
            let mut state = self.lock_state();
            let reused = state.idle.pop_front();
            if reused.is_none() {
                state.total += 1;
            }
            reused
        };

        if let Some(conn) = reused {
            debug!(connection_id = conn.id(), "Reusing idle connection");
            return Ok(conn);
        }

        let slot = OpeningSlot {
            pool: self,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            armed: true,
        };
        match self.connector.connect().await {
            Ok(conn) => {
                debug!(connection_id = slot.id, "Opened new connection");
                Ok(slot.fill(conn))
            }
            Err(e) => {
                warn!(connection_id = slot.id, error = %e, "Failed to open connection");
                Err(e)
            }
        }
    }

    fn release(&self, conn: PhysicalConnection<C::Connection>) {
        self.lock_state().idle.push_back(conn);
        self.semaphore.add_permits(1);
    }

    fn discard(&self, conn: PhysicalConnection<C::Connection>) {
        let id = conn.id();
        {
            let mut state = self.lock_state();
            state.total = state.total.saturating_sub(1);
        }
        self.semaphore.add_permits(1);
        self.notify_removed(id);
        self.dispose(conn);
    }

    fn subscribe_removals(&self) -> broadcast::Receiver<ConnectionRemoved> {
        self.removals.subscribe()
    }

    fn terminate_idle(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock_state();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        let count = drained.len();
        for conn in drained {
            self.notify_removed(conn.id());
            self.dispose(conn);
        }
        count
    }

    fn close(&self) {
        if !self.semaphore.is_closed() {
            debug!(waiting = self.waiting_count(), "Closing pool to new acquisitions");
            self.semaphore.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
