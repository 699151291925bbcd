//! Scripted in-memory connections for driving the facade without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use db_pool_facade::config::ClientConfiguration;
use db_pool_facade::db::{
    ConnectionExecutor, Connector, DatabasePool, ManagedPool, RawPool, RowHandler,
};
use db_pool_facade::error::{DbError, DbResult};
use db_pool_facade::models::{ColumnType, Field, QueryParam, QueryResult, Row, SqlQuery};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Responder = dyn Fn(&str) -> DbResult<QueryResult> + Send + Sync;

/// Statements containing this marker hang for a minute before answering.
pub const SLOW_MARKER: &str = "pg_sleep";

/// Shared record of everything the scripted connections did.
#[derive(Default)]
pub struct Journal {
    statements: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl Journal {
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn count(&self, sql: &str) -> usize {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnection {
    journal: Arc<Journal>,
    responder: Arc<Responder>,
}

#[async_trait]
impl ConnectionExecutor for ScriptedConnection {
    async fn query(&mut self, query: &SqlQuery) -> DbResult<QueryResult> {
        self.journal
            .statements
            .lock()
            .unwrap()
            .push(query.sql().to_string());
        tokio::task::yield_now().await;
        if query.sql().contains(SLOW_MARKER) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        (self.responder)(query.sql())
    }

    async fn stream(&mut self, query: &SqlQuery, on_row: &mut RowHandler<'_>) -> DbResult<u64> {
        let rows = self.query(query).await?.rows;
        let mut delivered = 0;
        for row in rows {
            on_row(row)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn copy_from_binary(
        &mut self,
        query: &SqlQuery,
        tuples: &[Vec<QueryParam>],
        _column_types: &[ColumnType],
    ) -> DbResult<u64> {
        self.query(query).await?;
        Ok(tuples.len() as u64)
    }

    async fn close(self) -> DbResult<()> {
        self.journal.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedConnector {
    journal: Arc<Journal>,
    responder: Arc<Responder>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> DbResult<ScriptedConnection> {
        self.journal.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            journal: Arc::clone(&self.journal),
            responder: Arc::clone(&self.responder),
        })
    }
}

pub type TestPool = DatabasePool<ManagedPool<ScriptedConnector>>;

/// A single-column result with one row per value.
pub fn column(name: &str, values: Vec<JsonValue>) -> QueryResult {
    let columns: Arc<[String]> = Arc::from(vec![name.to_string()]);
    let rows = values
        .into_iter()
        .map(|v| Row::new(Arc::clone(&columns), vec![v]))
        .collect();
    QueryResult::from_rows(vec![Field::new(name, "int8")], rows)
}

/// Control statements succeed; everything else returns one row `{"value": 1}`.
pub fn default_responder(sql: &str) -> DbResult<QueryResult> {
    match sql {
        "BEGIN" | "COMMIT" | "ROLLBACK" => Ok(QueryResult::empty()),
        s if s.starts_with("SAVEPOINT")
            || s.starts_with("RELEASE")
            || s.starts_with("ROLLBACK TO") =>
        {
            Ok(QueryResult::empty())
        }
        _ => Ok(column("value", vec![JsonValue::from(1)])),
    }
}

pub fn serialization_failure() -> DbError {
    DbError::database(
        "could not serialize access due to concurrent update",
        Some("40001".to_string()),
        "Retry the transaction",
    )
}

pub fn pool_with<R>(responder: R, config: ClientConfiguration) -> (TestPool, Arc<Journal>)
where
    R: Fn(&str) -> DbResult<QueryResult> + Send + Sync + 'static,
{
    let journal = Arc::new(Journal::default());
    let connector = ScriptedConnector {
        journal: Arc::clone(&journal),
        responder: Arc::new(responder),
    };
    let raw = ManagedPool::new(connector, config.max_connections, config.acquire_timeout);
    (DatabasePool::new(raw, config), journal)
}

pub fn test_config() -> ClientConfiguration {
    ClientConfiguration::default()
        .with_max_connections(4)
        .with_acquire_timeout(Duration::from_secs(5))
}

pub fn default_pool() -> (TestPool, Arc<Journal>) {
    pool_with(default_responder, test_config())
}

/// Park `n` idle connections in the pool.
pub async fn fill_idle(pool: &TestPool, n: usize) {
    let raw = pool.raw_pool();
    let mut held = Vec::new();
    for _ in 0..n {
        held.push(raw.acquire().await.unwrap());
    }
    for conn in held {
        raw.release(conn);
    }
}

/// Yield until `condition` holds, giving up after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
