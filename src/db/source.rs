//! Connection sources and the query verbs built on them.
//!
//! A [`ConnectionSource`] decides *where* a verb's connection comes from:
//! the pool handle borrows one per call, a bound connection reuses the one it
//! already holds. [`Queryable`] implements every query verb once on top of
//! that, so both kinds of source share identical result shapes, validation
//! and error propagation.
//!
//! Every verb converts its token into an executable [`SqlQuery`] before asking
//! the source for a connection; a malformed token never touches the pool.

use crate::db::copy::validate_copy;
use crate::db::executor::ConnectionExecutor;
use crate::error::DbResult;
use crate::models::{
    ColumnType, ConnectionMode, QueryParam, QueryResult, Row, SqlQuery, SqlToken,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;

/// Somewhere a verb can get a connection from.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    type Connection: ConnectionExecutor;

    /// Run `work` against a connection.
    ///
    /// `mode` tags how an implicit source acquires the connection. Bound
    /// sources ignore it and always use the connection they hold.
    async fn with_connection<T, F>(&self, mode: ConnectionMode, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Self::Connection) -> BoxFuture<'c, DbResult<T>> + Send;
}

/// Unwrap the executable query from a verb argument.
fn executable(query: impl Into<SqlToken>) -> DbResult<SqlQuery> {
    query.into().into_query()
}

/// Query verbs shared by every [`ConnectionSource`].
#[async_trait]
pub trait Queryable: ConnectionSource {
    /// All rows.
    async fn any<Q>(&self, query: Q) -> DbResult<Vec<Row>>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.any(&query).await })
        })
        .await
    }

    /// First column of every row.
    async fn any_first<Q>(&self, query: Q) -> DbResult<Vec<JsonValue>>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.any_first(&query).await })
        })
        .await
    }

    /// Whether the query returns at least one row.
    async fn exists<Q>(&self, query: Q) -> DbResult<bool>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.exists(&query).await })
        })
        .await
    }

    /// All rows; fails with `NotFound` when there are none.
    async fn many<Q>(&self, query: Q) -> DbResult<Vec<Row>>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.many(&query).await })
        })
        .await
    }

    async fn many_first<Q>(&self, query: Q) -> DbResult<Vec<JsonValue>>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.many_first(&query).await })
        })
        .await
    }

    /// Zero or one row.
    async fn maybe_one<Q>(&self, query: Q) -> DbResult<Option<Row>>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.maybe_one(&query).await })
        })
        .await
    }

    async fn maybe_one_first<Q>(&self, query: Q) -> DbResult<Option<JsonValue>>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.maybe_one_first(&query).await })
        })
        .await
    }

    /// Exactly one row.
    async fn one<Q>(&self, query: Q) -> DbResult<Row>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.one(&query).await })
        })
        .await
    }

    async fn one_first<Q>(&self, query: Q) -> DbResult<JsonValue>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.one_first(&query).await })
        })
        .await
    }

    /// Run any statement and return its full result.
    async fn query<Q>(&self, query: Q) -> DbResult<QueryResult>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.query(&query).await })
        })
        .await
    }

    /// Feed each row to `handler` as it arrives.
    ///
    /// A handler error stops the stream and is returned. Returns the number of
    /// rows delivered.
    async fn stream<Q, F>(&self, query: Q, mut handler: F) -> DbResult<u64>
    where
        Q: Into<SqlToken> + Send,
        F: FnMut(Row) -> DbResult<()> + Send + 'static,
    {
        let query = executable(query)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move { conn.stream(&query, &mut handler).await })
        })
        .await
    }

    /// Bulk-load `tuples` through a PostgreSQL `COPY ... FROM STDIN BINARY`.
    async fn copy_from_binary<Q>(
        &self,
        query: Q,
        tuples: Vec<Vec<QueryParam>>,
        column_types: Vec<ColumnType>,
    ) -> DbResult<u64>
    where
        Q: Into<SqlToken> + Send,
    {
        let query = executable(query)?;
        validate_copy(&query, &tuples, &column_types)?;
        self.with_connection(ConnectionMode::ImplicitQuery, move |conn| {
            Box::pin(async move {
                conn.copy_from_binary(&query, &tuples, &column_types)
                    .await
            })
        })
        .await
    }
}

impl<S: ConnectionSource> Queryable for S {}
