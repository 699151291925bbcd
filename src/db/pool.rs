//! The pool handle.
//!
//! [`DatabasePool`] is the facade callers hold. It implements
//! [`ConnectionSource`] by borrowing a connection from the raw pool for each
//! call, and exposes `connect`, `transaction`, `end` and the pool snapshot.
//!
//! # Admission
//!
//! Once `end()` has been called, new implicit calls fail with
//! [`DbError::PoolShuttingDown`] without touching the raw pool. A call that was
//! admitted before `end()` but only got its connection afterwards is rejected
//! the same way, and that connection is discarded. Connections handed back
//! after `end()` are discarded rather than parked idle, so the pool can only
//! shrink once shutdown has started.

use crate::config::ClientConfiguration;
use crate::db::bound::BoundConnection;
use crate::db::lifecycle::PoolLifecycle;
use crate::db::raw_pool::{PhysicalConnection, RawPool};
use crate::db::shutdown::drain;
use crate::db::source::ConnectionSource;
use crate::db::transaction::run_transaction;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionMode, PoolSnapshot};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A checked-out connection, returned to the pool when dropped.
///
/// Dropping the lease releases the connection on every exit path. The
/// connection is discarded instead when it was marked broken, when the pool
/// has ended, or when the lease is dropped with a statement still running on
/// it (the caller's future was cancelled mid-statement).
pub struct PoolLease<P: RawPool> {
    pool: Arc<P>,
    lifecycle: Arc<PoolLifecycle>,
    conn: Option<PhysicalConnection<P::Connection>>,
    mode: ConnectionMode,
    broken: bool,
    in_flight: bool,
}

impl<P: RawPool> PoolLease<P> {
    fn new(
        pool: Arc<P>,
        lifecycle: Arc<PoolLifecycle>,
        conn: PhysicalConnection<P::Connection>,
        mode: ConnectionMode,
    ) -> Self {
        Self {
            pool,
            lifecycle,
            conn: Some(conn),
            mode,
            broken: false,
            in_flight: false,
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(PhysicalConnection::id)
    }

    /// Discard the connection on drop instead of returning it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Mark the lease broken if `result` failed in a way that leaves the
    /// connection unusable.
    pub(crate) fn observe<T>(&mut self, result: &DbResult<T>) {
        if let Err(e) = result {
            if e.breaks_connection() {
                self.broken = true;
            }
        }
    }

    /// Run `work` on the leased connection.
    ///
    /// The lease counts as in flight until `work` finishes. If the future is
    /// dropped before that, the connection is discarded on drop.
    pub(crate) async fn run<T, F>(&mut self, work: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>>,
    {
        let conn = self
            .conn
            .as_mut()
            .map(|conn| &mut **conn)
            .ok_or_else(|| DbError::internal("lease has no connection"))?;
        self.in_flight = true;
        let result = work(conn).await;
        self.in_flight = false;
        self.observe(&result);
        result
    }
}

impl<P: RawPool> Drop for PoolLease<P> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = conn.id();
        if self.broken {
            warn!(connection_id = id, mode = %self.mode, "Discarding broken connection");
            self.pool.discard(conn);
        } else if self.in_flight {
            warn!(connection_id = id, mode = %self.mode, "Statement cancelled, discarding connection");
            self.pool.discard(conn);
        } else if self.lifecycle.is_ended() {
            debug!(connection_id = id, mode = %self.mode, "Pool ended, discarding connection");
            self.pool.discard(conn);
        } else {
            debug!(connection_id = id, mode = %self.mode, "Releasing connection");
            self.pool.release(conn);
            if self.lifecycle.is_ended() {
                self.lifecycle.notify_returned();
            }
        }
    }
}

impl<P: RawPool> std::fmt::Debug for PoolLease<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("connection_id", &self.connection_id())
            .field("mode", &self.mode)
            .field("broken", &self.broken)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// Handle to a connection pool.
///
/// Cloning is cheap; clones share the raw pool, lifecycle state and
/// configuration.
pub struct DatabasePool<P: RawPool> {
    raw: Arc<P>,
    lifecycle: Arc<PoolLifecycle>,
    config: Arc<ClientConfiguration>,
}

impl<P: RawPool> Clone for DatabasePool<P> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            lifecycle: Arc::clone(&self.lifecycle),
            config: Arc::clone(&self.config),
        }
    }
}

impl<P: RawPool> std::fmt::Debug for DatabasePool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("state", &self.get_pool_state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: RawPool> DatabasePool<P> {
    /// Wrap a raw pool. The lifecycle state is created here, one per raw pool.
    pub fn new(raw: P, config: ClientConfiguration) -> Self {
        Self {
            raw: Arc::new(raw),
            lifecycle: Arc::new(PoolLifecycle::new()),
            config: Arc::new(config),
        }
    }

    /// The configuration this handle was built with.
    pub fn configuration(&self) -> &ClientConfiguration {
        &self.config
    }

    pub fn raw_pool(&self) -> &P {
        &self.raw
    }

    pub fn is_ended(&self) -> bool {
        self.lifecycle.is_ended()
    }

    /// Point-in-time pool counters. Never acquires or mutates anything.
    pub fn get_pool_state(&self) -> PoolSnapshot {
        let total = self.raw.total_count();
        let idle = self.raw.idle_count();
        PoolSnapshot {
            active_connection_count: total.saturating_sub(idle),
            idle_connection_count: idle,
            waiting_client_count: self.raw.waiting_count(),
            ended: self.lifecycle.is_ended(),
        }
    }

    /// Borrow a connection from the raw pool.
    pub async fn acquire(&self, mode: ConnectionMode) -> DbResult<PoolLease<P>> {
        if self.lifecycle.is_ended() {
            debug!(%mode, "Rejecting acquisition, pool has ended");
            return Err(DbError::PoolShuttingDown);
        }

        let conn = self.raw.acquire().await?;
        let lease = PoolLease::new(
            Arc::clone(&self.raw),
            Arc::clone(&self.lifecycle),
            conn,
            mode,
        );

        // end() may have run while this call was waiting; the lease drop
        // discards the connection.
        if self.lifecycle.is_ended() {
            debug!(%mode, "Pool ended during acquisition");
            return Err(DbError::PoolShuttingDown);
        }

        debug!(connection_id = ?lease.connection_id(), %mode, "Acquired connection");
        Ok(lease)
    }

    /// Run `handler` with a connection held for the whole block.
    ///
    /// Verbs called on the [`BoundConnection`] inside the block reuse that
    /// connection. It is released when the block finishes, success or failure.
    pub async fn connect<T, F>(&self, handler: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let lease = self.acquire(ConnectionMode::Explicit).await?;
        let bound = BoundConnection::new(lease, self.config.transaction_retry_limit);
        handler(&bound).await
    }

    /// Run `handler` inside a transaction on a dedicated connection.
    ///
    /// Retryable failures (serialization conflicts, deadlocks) re-run the whole
    /// transaction up to `retry_limit` more times, falling back to the
    /// configured limit when `None`.
    pub async fn transaction<T, F>(&self, handler: F, retry_limit: Option<u32>) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let limit = retry_limit.unwrap_or(self.config.transaction_retry_limit);
        let lease = self.acquire(ConnectionMode::ImplicitTransaction).await?;
        let bound = BoundConnection::new(lease, self.config.transaction_retry_limit);
        run_transaction(&bound, handler, limit).await
    }

    /// Shut the pool down and wait until every connection is gone.
    ///
    /// Active connections are left to finish; they are removed as they come
    /// back. Safe to call more than once.
    pub async fn end(&self) {
        let before = self.get_pool_state();
        info!(
            active = before.active_connection_count,
            idle = before.idle_connection_count,
            "Ending pool"
        );
        drain(self.raw.as_ref(), &self.lifecycle).await;
        info!("Pool drained");
    }
}

#[async_trait]
impl<P: RawPool> ConnectionSource for DatabasePool<P> {
    type Connection = P::Connection;

    async fn with_connection<T, F>(&self, mode: ConnectionMode, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut lease = self.acquire(mode).await?;
        lease.run(work).await
    }
}
