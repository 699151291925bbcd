//! Connection executor boundary.
//!
//! A [`ConnectionExecutor`] is one physical connection able to run statements.
//! Implementors supply three primitives (`query`, `stream`, `copy_from_binary`)
//! plus `close`; the result-shape verbs (`any`, `one`, `maybe_one_first`, ...)
//! are derived from `query` once, here, so every backend enforces the same
//! row-count and column-count rules.

use crate::error::{DbError, DbResult};
use crate::models::{ColumnType, QueryParam, QueryResult, Row, SqlQuery};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Callback receiving streamed rows. Returning an error stops the stream.
pub type RowHandler<'a> = dyn FnMut(Row) -> DbResult<()> + Send + 'a;

#[async_trait]
pub trait ConnectionExecutor: Send + 'static {
    /// Run a statement and collect its full result.
    async fn query(&mut self, query: &SqlQuery) -> DbResult<QueryResult>;

    /// Run a statement, handing each row to `on_row` as it arrives.
    ///
    /// Returns the number of rows delivered.
    async fn stream(&mut self, query: &SqlQuery, on_row: &mut RowHandler<'_>) -> DbResult<u64>;

    /// Bulk-load `tuples` through a binary COPY statement.
    ///
    /// Returns the number of rows copied.
    async fn copy_from_binary(
        &mut self,
        query: &SqlQuery,
        tuples: &[Vec<QueryParam>],
        column_types: &[ColumnType],
    ) -> DbResult<u64>;

    /// Close the physical connection.
    async fn close(self) -> DbResult<()>
    where
        Self: Sized;

    async fn any(&mut self, query: &SqlQuery) -> DbResult<Vec<Row>> {
        Ok(self.query(query).await?.rows)
    }

    async fn any_first(&mut self, query: &SqlQuery) -> DbResult<Vec<JsonValue>> {
        let rows = self.any(query).await?;
        rows.into_iter().map(Row::into_first).collect()
    }

    async fn exists(&mut self, query: &SqlQuery) -> DbResult<bool> {
        let wrapped = query.wrap("SELECT EXISTS({})");
        match self.one_first(&wrapped).await? {
            JsonValue::Bool(exists) => Ok(exists),
            // MySQL and SQLite report EXISTS as an integer
            JsonValue::Number(n) => Ok(n.as_i64().is_some_and(|v| v != 0)),
            other => Err(DbError::data_integrity(format!(
                "EXISTS returned a non-boolean value: {}",
                other
            ))),
        }
    }

    async fn many(&mut self, query: &SqlQuery) -> DbResult<Vec<Row>> {
        let rows = self.any(query).await?;
        if rows.is_empty() {
            return Err(DbError::NotFound);
        }
        Ok(rows)
    }

    async fn many_first(&mut self, query: &SqlQuery) -> DbResult<Vec<JsonValue>> {
        let rows = self.many(query).await?;
        rows.into_iter().map(Row::into_first).collect()
    }

    async fn maybe_one(&mut self, query: &SqlQuery) -> DbResult<Option<Row>> {
        let rows = self.any(query).await?;
        at_most_one(rows)
    }

    async fn maybe_one_first(&mut self, query: &SqlQuery) -> DbResult<Option<JsonValue>> {
        self.maybe_one(query).await?.map(Row::into_first).transpose()
    }

    async fn one(&mut self, query: &SqlQuery) -> DbResult<Row> {
        self.maybe_one(query).await?.ok_or(DbError::NotFound)
    }

    async fn one_first(&mut self, query: &SqlQuery) -> DbResult<JsonValue> {
        self.one(query).await?.into_first()
    }
}

fn at_most_one(rows: Vec<Row>) -> DbResult<Option<Row>> {
    if rows.len() > 1 {
        return Err(DbError::data_integrity(format!(
            "expected at most one row, got {}",
            rows.len()
        )));
    }
    Ok(rows.into_iter().next())
}
