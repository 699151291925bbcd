//! Explicit connection contexts.
//!
//! A [`BoundConnection`] holds one leased connection for the duration of a
//! `connect` or `transaction` block. Verbs called on it run on that
//! connection, in the order they are issued, and never acquire another one.

use crate::db::pool::PoolLease;
use crate::db::raw_pool::RawPool;
use crate::db::source::ConnectionSource;
use crate::db::transaction::{run_savepoint, run_transaction};
use crate::db::executor::ConnectionExecutor;
use crate::error::DbResult;
use crate::models::{ConnectionMode, SqlQuery};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Mutex;
use tracing::warn;

pub struct BoundConnection<P: RawPool> {
    lease: Mutex<PoolLease<P>>,
    mode: ConnectionMode,
    transaction_depth: AtomicU32,
    /// Set between a successful BEGIN and the COMMIT or ROLLBACK closing it.
    transaction_open: AtomicBool,
    retry_limit: u32,
}

impl<P: RawPool> BoundConnection<P> {
    pub(crate) fn new(lease: PoolLease<P>, retry_limit: u32) -> Self {
        Self {
            mode: lease.mode(),
            lease: Mutex::new(lease),
            transaction_depth: AtomicU32::new(0),
            transaction_open: AtomicBool::new(false),
            retry_limit,
        }
    }

    /// How the underlying connection was acquired.
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Number of transactions (including savepoints) currently open.
    pub fn transaction_depth(&self) -> u32 {
        self.transaction_depth.load(Ordering::Acquire)
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    /// Run a control statement (BEGIN, COMMIT, SAVEPOINT, ...).
    pub(crate) async fn execute(&self, sql: &str) -> DbResult<()> {
        let statement = SqlQuery::new(sql);
        self.with_connection(self.mode, move |conn| {
            Box::pin(async move { conn.query(&statement).await.map(|_| ()) })
        })
        .await
    }

    /// Make sure the connection is discarded rather than reused.
    pub(crate) async fn mark_broken(&self) {
        self.lease.lock().await.mark_broken();
    }

    pub(crate) fn set_transaction_open(&self, open: bool) {
        self.transaction_open.store(open, Ordering::Release);
    }

    pub(crate) fn enter_transaction(&self) -> DepthGuard<'_> {
        self.transaction_depth.fetch_add(1, Ordering::AcqRel);
        DepthGuard(&self.transaction_depth)
    }

    /// Run `handler` on this same connection.
    pub async fn connect<T, F>(&self, handler: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        handler(self).await
    }

    /// Run `handler` in a transaction on this connection.
    ///
    /// Inside an open transaction this becomes a savepoint, which is never
    /// retried. Otherwise it behaves like
    /// [`DatabasePool::transaction`](crate::db::pool::DatabasePool::transaction).
    pub async fn transaction<T, F>(&self, handler: F, retry_limit: Option<u32>) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        if self.in_transaction() {
            run_savepoint(self, handler).await
        } else {
            run_transaction(self, handler, retry_limit.unwrap_or(self.retry_limit)).await
        }
    }
}

impl<P: RawPool> std::fmt::Debug for BoundConnection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundConnection")
            .field("mode", &self.mode)
            .field("transaction_depth", &self.transaction_depth())
            .finish_non_exhaustive()
    }
}

impl<P: RawPool> Drop for BoundConnection<P> {
    fn drop(&mut self) {
        // A transaction still open here was abandoned mid-body; the
        // connection must not go back idle inside it.
        if *self.transaction_open.get_mut() {
            let lease = self.lease.get_mut();
            warn!(
                connection_id = ?lease.connection_id(),
                "Transaction abandoned before COMMIT or ROLLBACK"
            );
            lease.mark_broken();
        }
    }
}

/// Decrements the transaction depth when dropped.
pub(crate) struct DepthGuard<'a>(&'a AtomicU32);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl<P: RawPool> ConnectionSource for BoundConnection<P> {
    type Connection = P::Connection;

    async fn with_connection<T, F>(&self, _mode: ConnectionMode, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut P::Connection) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut lease = self.lease.lock().await;
        lease.run(work).await
    }
}
