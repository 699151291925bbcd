//! Pool facade behaviour against scripted connections.

mod common;

use common::*;
use db_pool_facade::db::{Queryable, RawPool};
use db_pool_facade::error::DbError;
use db_pool_facade::models::{ColumnType, ConnectionMode, QueryParam, SqlQuery, SqlToken};
use futures_util::FutureExt;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

// =============================================================================
// Implicit verbs
// =============================================================================

#[tokio::test]
async fn test_implicit_verb_releases_connection_on_success() {
    let (pool, journal) = default_pool();

    let value = pool.one_first(SqlQuery::new("SELECT 1 AS value")).await.unwrap();
    assert_eq!(value, json!(1));

    let state = pool.get_pool_state();
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(state.idle_connection_count, 1);
    assert_eq!(journal.opened(), 1);
}

#[tokio::test]
async fn test_implicit_verb_releases_connection_on_failure() {
    let (pool, journal) = pool_with(
        |sql| {
            if sql.contains("missing") {
                Ok(column("value", vec![]))
            } else {
                default_responder(sql)
            }
        },
        test_config(),
    );

    let err = pool.one(SqlQuery::new("SELECT * FROM missing")).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound { .. }), "got {err:?}");

    let state = pool.get_pool_state();
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(state.idle_connection_count, 1);
    assert_eq!(journal.opened(), 1);
}

#[tokio::test]
async fn test_sequential_verbs_reuse_one_connection() {
    let (pool, journal) = default_pool();

    pool.any(SqlQuery::new("SELECT 1")).await.unwrap();
    pool.many(SqlQuery::new("SELECT 1")).await.unwrap();
    pool.maybe_one(SqlQuery::new("SELECT 1")).await.unwrap();
    assert!(pool.exists(SqlQuery::new("SELECT 1")).await.unwrap());
    pool.query(SqlQuery::new("SELECT 1")).await.unwrap();

    assert_eq!(journal.opened(), 1);
    assert_eq!(pool.get_pool_state().idle_connection_count, 1);
}

#[tokio::test]
async fn test_verb_result_shapes() {
    let (pool, _journal) = pool_with(
        |sql| match sql {
            "SELECT many" => Ok(column("n", vec![json!(1), json!(2), json!(3)])),
            "SELECT none" => Ok(column("n", vec![])),
            _ => default_responder(sql),
        },
        test_config(),
    );

    assert_eq!(pool.any(SqlQuery::new("SELECT none")).await.unwrap().len(), 0);
    assert_eq!(
        pool.any_first(SqlQuery::new("SELECT many")).await.unwrap(),
        vec![json!(1), json!(2), json!(3)]
    );
    assert_eq!(
        pool.many_first(SqlQuery::new("SELECT many")).await.unwrap(),
        vec![json!(1), json!(2), json!(3)]
    );
    assert!(pool.maybe_one(SqlQuery::new("SELECT none")).await.unwrap().is_none());
    assert!(pool.maybe_one_first(SqlQuery::new("SELECT none")).await.unwrap().is_none());

    let err = pool.many(SqlQuery::new("SELECT none")).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound { .. }));

    let err = pool.one(SqlQuery::new("SELECT many")).await.unwrap_err();
    assert!(matches!(err, DbError::DataIntegrity { .. }), "got {err:?}");

    let err = pool.maybe_one_first(SqlQuery::new("SELECT many")).await.unwrap_err();
    assert!(matches!(err, DbError::DataIntegrity { .. }));
}

#[tokio::test]
async fn test_stream_delivers_rows_in_order() {
    let (pool, _journal) = pool_with(
        |sql| match sql {
            "SELECT n" => Ok(column("n", vec![json!(1), json!(2), json!(3)])),
            _ => default_responder(sql),
        },
        test_config(),
    );

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let count = pool
        .stream(SqlQuery::new("SELECT n"), move |row| {
            sink.lock().unwrap().push(row.values()[0].clone());
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(count, 3);
    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(pool.get_pool_state().active_connection_count, 0);
}

#[tokio::test]
async fn test_stream_handler_error_stops_stream_and_releases() {
    let (pool, _journal) = pool_with(
        |sql| match sql {
            "SELECT n" => Ok(column("n", vec![json!(1), json!(2), json!(3)])),
            _ => default_responder(sql),
        },
        test_config(),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let err = pool
        .stream(SqlQuery::new("SELECT n"), move |_row| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(DbError::validation("stop"));
            }
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(pool.get_pool_state().idle_connection_count, 1);
}

#[tokio::test]
async fn test_copy_from_binary_runs_on_implicit_connection() {
    let (pool, journal) = default_pool();

    let copied = pool
        .copy_from_binary(
            SqlQuery::new("COPY items (id, name) FROM STDIN BINARY"),
            vec![
                vec![QueryParam::Int(1), QueryParam::from("a")],
                vec![QueryParam::Int(2), QueryParam::Null],
            ],
            vec![ColumnType::Int4, ColumnType::Text],
        )
        .await
        .unwrap();

    assert_eq!(copied, 2);
    assert_eq!(journal.count("COPY items (id, name) FROM STDIN BINARY"), 1);
    assert_eq!(pool.get_pool_state().active_connection_count, 0);
}

// =============================================================================
// Validation happens before acquisition
// =============================================================================

#[tokio::test]
async fn test_invalid_stream_token_fails_before_acquisition() {
    let (pool, journal) = default_pool();
    let before = pool.get_pool_state();

    let err = pool
        .stream(SqlToken::Identifier(vec!["users".into()]), |_row| Ok(()))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation { .. }));
    assert_eq!(pool.get_pool_state(), before);
    assert_eq!(journal.opened(), 0);
}

#[tokio::test]
async fn test_invalid_copy_arguments_fail_before_acquisition() {
    let (pool, journal) = default_pool();
    let before = pool.get_pool_state();

    // Tuple width does not match the column types.
    let err = pool
        .copy_from_binary(
            SqlQuery::new("COPY items (id, name) FROM STDIN BINARY"),
            vec![vec![QueryParam::Int(1)]],
            vec![ColumnType::Int4, ColumnType::Text],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    let err = pool
        .copy_from_binary(SqlToken::Raw("COPY items".into()), vec![], vec![ColumnType::Int4])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    assert_eq!(pool.get_pool_state(), before);
    assert_eq!(journal.opened(), 0);
}

#[tokio::test]
async fn test_raw_text_is_rejected_before_acquisition() {
    let (pool, journal) = default_pool();

    let err = pool.any("SELECT 1").await.unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    let err = pool.query(String::from("DELETE FROM users")).await.unwrap_err();
    assert!(matches!(err, DbError::Validation { .. }));

    assert_eq!(journal.opened(), 0);
    assert!(journal.statements().is_empty());
}

#[tokio::test]
async fn test_unbound_placeholder_fails_before_acquisition() {
    let (pool, journal) = default_pool();

    let err = pool
        .one(SqlQuery::new("SELECT * FROM users WHERE id = $1"))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation { .. }));
    assert_eq!(journal.opened(), 0);
}

// =============================================================================
// Explicit connections
// =============================================================================

#[tokio::test]
async fn test_connect_reuses_single_connection() {
    let (pool, journal) = default_pool();
    let inner = pool.clone();

    let total_inside = pool
        .connect(move |conn| {
            Box::pin(async move {
                assert_eq!(conn.mode(), ConnectionMode::Explicit);
                conn.any(SqlQuery::new("SELECT 1")).await?;
                conn.one_first(SqlQuery::new("SELECT 1")).await?;
                conn.exists(SqlQuery::new("SELECT 1")).await?;
                Ok(inner.raw_pool().total_count())
            })
        })
        .await
        .unwrap();

    assert_eq!(total_inside, 1);
    assert_eq!(journal.opened(), 1);
    assert_eq!(pool.get_pool_state().idle_connection_count, 1);
}

#[tokio::test]
async fn test_connect_releases_connection_on_handler_error() {
    let (pool, _journal) = default_pool();

    let err = pool
        .connect(|conn| {
            Box::pin(async move {
                conn.any(SqlQuery::new("SELECT 1")).await?;
                Err::<(), _>(DbError::validation("handler failed"))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation { .. }));
    let state = pool.get_pool_state();
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(state.idle_connection_count, 1);
}

#[tokio::test]
async fn test_connection_error_discards_connection() {
    let (pool, journal) = pool_with(
        |sql| {
            if sql == "SELECT broken" {
                Err(DbError::connection("connection reset", "Reconnect"))
            } else {
                default_responder(sql)
            }
        },
        test_config(),
    );

    let err = pool.any(SqlQuery::new("SELECT broken")).await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));

    let state = pool.get_pool_state();
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(state.idle_connection_count, 0);

    pool.any(SqlQuery::new("SELECT 1")).await.unwrap();
    assert_eq!(journal.opened(), 2);
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let (pool, journal) = default_pool();

    let value = pool
        .transaction(
            |conn| {
                Box::pin(async move {
                    assert!(conn.in_transaction());
                    assert_eq!(conn.mode(), ConnectionMode::ImplicitTransaction);
                    conn.one_first(SqlQuery::new("INSERT INTO t VALUES (1) RETURNING 1")).await
                })
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(value, json!(1));
    assert_eq!(
        journal.statements(),
        vec!["BEGIN", "INSERT INTO t VALUES (1) RETURNING 1", "COMMIT"]
    );
    assert_eq!(pool.get_pool_state().idle_connection_count, 1);
}

#[tokio::test]
async fn test_transaction_rolls_back_and_surfaces_handler_error() {
    let (pool, journal) = default_pool();

    let err = pool
        .transaction(
            |conn| {
                Box::pin(async move {
                    conn.query(SqlQuery::new("INSERT INTO t VALUES (1)")).await?;
                    Err::<(), _>(DbError::validation("boom"))
                })
            },
            Some(3),
        )
        .await
        .unwrap_err();

    match err {
        DbError::Validation { message } => assert_eq!(message, "boom"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        journal.statements(),
        vec!["BEGIN", "INSERT INTO t VALUES (1)", "ROLLBACK"]
    );
    assert_eq!(journal.count("BEGIN"), 1);
    assert_eq!(pool.get_pool_state().active_connection_count, 0);
}

#[tokio::test]
async fn test_retryable_commit_failure_is_bounded() {
    let (pool, journal) = pool_with(
        |sql| {
            if sql == "COMMIT" {
                Err(serialization_failure())
            } else {
                default_responder(sql)
            }
        },
        test_config(),
    );

    let attempts = Arc::new(AtomicUsize::new(0));
    let err = pool
        .transaction(
            |conn| {
                let attempts = Arc::clone(&attempts);
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    conn.query(SqlQuery::new("UPDATE t SET n = n + 1")).await?;
                    Ok(())
                })
            },
            Some(2),
        )
        .await
        .unwrap_err();

    assert_eq!(err.sql_state(), Some("40001"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(journal.count("BEGIN"), 3);
    assert_eq!(journal.count("COMMIT"), 3);
}

#[tokio::test]
async fn test_retryable_handler_failure_succeeds_on_retry() {
    let (pool, journal) = default_pool();

    let attempts = Arc::new(AtomicUsize::new(0));
    let value = pool
        .transaction(
            |conn| {
                let attempts = Arc::clone(&attempts);
                Box::pin(async move {
                    conn.query(SqlQuery::new("UPDATE t SET n = n + 1")).await?;
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(serialization_failure());
                    }
                    Ok("done")
                })
            },
            Some(1),
        )
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(journal.count("BEGIN"), 2);
    assert_eq!(journal.count("ROLLBACK"), 1);
    assert_eq!(journal.count("COMMIT"), 1);
    assert_eq!(journal.opened(), 1);
}

#[tokio::test]
async fn test_zero_retry_limit_runs_once() {
    let (pool, journal) = default_pool();

    let err = pool
        .transaction(
            |_conn| Box::pin(async move { Err::<(), _>(serialization_failure()) }),
            Some(0),
        )
        .await
        .unwrap_err();

    assert_eq!(err.sql_state(), Some("40001"));
    assert_eq!(journal.count("BEGIN"), 1);
}

#[tokio::test]
async fn test_configured_retry_limit_applies_by_default() {
    let (pool, journal) = pool_with(
        |sql| {
            if sql == "COMMIT" {
                Err(serialization_failure())
            } else {
                default_responder(sql)
            }
        },
        test_config().with_transaction_retry_limit(1),
    );

    pool.transaction(|_conn| Box::pin(async move { Ok(()) }), None)
        .await
        .unwrap_err();

    assert_eq!(journal.count("BEGIN"), 2);
}

#[tokio::test]
async fn test_failed_rollback_surfaces_rollback_error_and_discards() {
    let (pool, _journal) = pool_with(
        |sql| {
            if sql == "ROLLBACK" {
                Err(DbError::database("rollback failed", None, "Check the server"))
            } else {
                default_responder(sql)
            }
        },
        test_config(),
    );

    let err = pool
        .transaction(
            |_conn| Box::pin(async move { Err::<(), _>(serialization_failure()) }),
            Some(5),
        )
        .await
        .unwrap_err();

    match err {
        DbError::Database { ref message, .. } => assert_eq!(message, "rollback failed"),
        other => panic!("unexpected error: {other:?}"),
    }
    let state = pool.get_pool_state();
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(state.idle_connection_count, 0);
}

#[tokio::test]
async fn test_nested_transaction_uses_savepoint() {
    let (pool, journal) = default_pool();

    pool.transaction(
        |conn| {
            Box::pin(async move {
                conn.query(SqlQuery::new("INSERT INTO t VALUES (1)")).await?;
                let inner = conn
                    .transaction(
                        |nested| {
                            Box::pin(async move {
                                assert_eq!(nested.transaction_depth(), 2);
                                nested.query(SqlQuery::new("INSERT INTO t VALUES (2)")).await?;
                                Err::<(), _>(DbError::validation("undo inner"))
                            })
                        },
                        None,
                    )
                    .await;
                assert!(inner.is_err());
                assert_eq!(conn.transaction_depth(), 1);
                Ok(())
            })
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        journal.statements(),
        vec![
            "BEGIN",
            "INSERT INTO t VALUES (1)",
            "SAVEPOINT savepoint_1",
            "INSERT INTO t VALUES (2)",
            "ROLLBACK TO SAVEPOINT savepoint_1",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_transaction_inside_connect_uses_same_connection() {
    let (pool, journal) = default_pool();

    pool.connect(|conn| {
        Box::pin(async move {
            conn.transaction(
                |tx| Box::pin(async move { tx.query(SqlQuery::new("INSERT INTO t VALUES (1)")).await }),
                None,
            )
            .await?;
            conn.any(SqlQuery::new("SELECT 1")).await
        })
    })
    .await
    .unwrap();

    assert_eq!(journal.opened(), 1);
    assert_eq!(journal.count("COMMIT"), 1);
}

// =============================================================================
// Pool state
// =============================================================================

#[tokio::test]
async fn test_get_pool_state_does_not_mutate() {
    let (pool, journal) = default_pool();
    fill_idle(&pool, 2).await;

    let first = pool.get_pool_state();
    let second = pool.get_pool_state();

    assert_eq!(first, second);
    assert_eq!(first.idle_connection_count, 2);
    assert_eq!(first.active_connection_count, 0);
    assert_eq!(first.waiting_client_count, 0);
    assert!(!first.ended);
    assert_eq!(journal.opened(), 2);
}

#[tokio::test]
async fn test_pool_state_counts_waiting_clients() {
    let config = test_config().with_max_connections(1);
    let (pool, _journal) = pool_with(default_responder, config);

    let lease = pool.acquire(ConnectionMode::Explicit).await.unwrap();
    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.any(SqlQuery::new("SELECT 1")).await }
    });
    wait_until(|| pool.get_pool_state().waiting_client_count == 1).await;

    let state = pool.get_pool_state();
    assert_eq!(state.active_connection_count, 1);
    assert_eq!(state.idle_connection_count, 0);

    drop(lease);
    let rows = waiting.await.unwrap().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(pool.get_pool_state().waiting_client_count, 0);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_end_on_empty_pool_does_not_suspend() {
    let (pool, _journal) = default_pool();

    assert!(pool.end().now_or_never().is_some());
    assert!(pool.get_pool_state().ended);
}

#[tokio::test]
async fn test_end_removes_all_idle_connections() {
    let (pool, _journal) = default_pool();
    fill_idle(&pool, 3).await;
    assert_eq!(pool.get_pool_state().idle_connection_count, 3);

    assert!(pool.end().now_or_never().is_some());

    let state = pool.get_pool_state();
    assert_eq!(state.idle_connection_count, 0);
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(pool.raw_pool().total_count(), 0);
}

#[tokio::test]
async fn test_end_waits_for_active_connection() {
    let (pool, _journal) = default_pool();
    fill_idle(&pool, 1).await;
    let lease = pool.acquire(ConnectionMode::Explicit).await.unwrap();

    let mut ending = tokio_test::task::spawn(pool.end());
    assert_pending!(ending.poll());

    let state = pool.get_pool_state();
    assert!(state.ended);
    assert_eq!(state.active_connection_count, 1);

    drop(lease);
    assert!(ending.is_woken());
    assert_ready!(ending.poll());
    assert_eq!(pool.raw_pool().total_count(), 0);
}

#[tokio::test]
async fn test_end_waits_for_open_transaction() {
    let (pool, journal) = default_pool();
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
    let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

    let worker = pool.clone();
    let entered = std::sync::Mutex::new(Some(entered_tx));
    let finish = std::sync::Mutex::new(Some(finish_rx));
    let running = tokio::spawn(async move {
        worker
            .transaction(
                move |conn| {
                    let entered = entered.lock().unwrap().take();
                    let finish = finish.lock().unwrap().take();
                    Box::pin(async move {
                        conn.query(SqlQuery::new("INSERT INTO t VALUES (1)")).await?;
                        if let Some(tx) = entered {
                            let _ = tx.send(());
                        }
                        if let Some(rx) = finish {
                            let _ = rx.await;
                        }
                        Ok(())
                    })
                },
                None,
            )
            .await
    });

    entered_rx.await.unwrap();
    let ending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.end().await }
    });

    wait_until(|| pool.get_pool_state().ended).await;
    assert!(!ending.is_finished());
    assert_eq!(pool.get_pool_state().active_connection_count, 1);

    finish_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), ending)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(journal.count("COMMIT"), 1);
    assert_eq!(pool.raw_pool().total_count(), 0);
}

#[tokio::test]
async fn test_verb_after_end_is_rejected_without_connecting() {
    let (pool, journal) = default_pool();
    pool.end().await;

    let err = pool.any(SqlQuery::new("SELECT 1")).await.unwrap_err();
    assert!(matches!(err, DbError::PoolShuttingDown));

    let err = pool
        .connect(|conn| Box::pin(async move { conn.any(SqlQuery::new("SELECT 1")).await }))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolShuttingDown));

    let err = pool
        .transaction(|_conn| Box::pin(async move { Ok(()) }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolShuttingDown));

    assert_eq!(journal.opened(), 0);
    assert_eq!(pool.raw_pool().total_count(), 0);
}

#[tokio::test]
async fn test_queued_waiter_never_opens_connection_after_end() {
    let config = test_config().with_max_connections(1);
    let (pool, journal) = pool_with(default_responder, config);

    let lease = pool.acquire(ConnectionMode::Explicit).await.unwrap();
    assert_eq!(journal.opened(), 1);
    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.any(SqlQuery::new("SELECT 1")).await }
    });
    wait_until(|| pool.get_pool_state().waiting_client_count == 1).await;

    let ending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.end().await }
    });

    // The queued caller is turned away while the lease is still out.
    let err = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, DbError::PoolShuttingDown));
    assert_eq!(pool.get_pool_state().waiting_client_count, 0);
    assert!(!ending.is_finished());

    drop(lease);
    tokio::time::timeout(Duration::from_secs(5), ending)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(journal.opened(), 1);
    assert_eq!(pool.raw_pool().total_count(), 0);
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let (pool, _journal) = default_pool();
    fill_idle(&pool, 1).await;

    pool.end().await;
    pool.end().await;

    let state = pool.get_pool_state();
    assert!(state.ended);
    assert_eq!(state.idle_connection_count, 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancelled_implicit_call_discards_connection() {
    let (pool, journal) = default_pool();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        pool.any(SqlQuery::new("SELECT pg_sleep(60)")),
    )
    .await;
    assert!(outcome.is_err());

    // The statement may still be running server-side; never reuse it.
    let state = pool.get_pool_state();
    assert_eq!(state.idle_connection_count, 0);
    assert_eq!(state.active_connection_count, 0);
    assert_eq!(pool.raw_pool().total_count(), 0);
    wait_until(|| journal.closed() == 1).await;

    assert_eq!(pool.one_first(SqlQuery::new("SELECT 1")).await.unwrap(), json!(1));
    assert_eq!(journal.opened(), 2);
}

#[tokio::test]
async fn test_cancelled_transaction_discards_connection() {
    let (pool, journal) = default_pool();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        pool.transaction(
            |_conn| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
            },
            None,
        ),
    )
    .await;
    assert!(outcome.is_err());

    // BEGIN went out and nothing closed it, so the connection is dropped
    // instead of going back idle inside an open transaction.
    assert_eq!(journal.statements(), vec!["BEGIN".to_string()]);
    let state = pool.get_pool_state();
    assert_eq!(state.idle_connection_count, 0);
    assert_eq!(state.active_connection_count, 0);
    wait_until(|| journal.closed() == 1).await;

    pool.query(SqlQuery::new("SELECT 1")).await.unwrap();
    assert_eq!(journal.opened(), 2);
    assert_eq!(journal.count("COMMIT"), 0);
}

#[tokio::test]
async fn test_cancelled_statement_inside_connect_discards_connection() {
    let (pool, journal) = default_pool();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        pool.connect(|conn| {
            Box::pin(async move {
                conn.query(SqlQuery::new("SELECT 1")).await?;
                conn.any(SqlQuery::new("SELECT pg_sleep(60)")).await
            })
        }),
    )
    .await;
    assert!(outcome.is_err());

    assert_eq!(pool.get_pool_state().idle_connection_count, 0);
    assert_eq!(pool.raw_pool().total_count(), 0);
    wait_until(|| journal.closed() == 1).await;
}

#[tokio::test]
async fn test_finished_transactions_keep_their_connection() {
    let (pool, journal) = default_pool();

    pool.transaction(|_conn| Box::pin(async move { Ok(()) }), None)
        .await
        .unwrap();
    let _ = pool
        .transaction(
            |_conn| Box::pin(async move { Err::<(), _>(DbError::validation("abort")) }),
            None,
        )
        .await;

    assert_eq!(journal.count("COMMIT"), 1);
    assert_eq!(journal.count("ROLLBACK"), 1);
    assert_eq!(pool.get_pool_state().idle_connection_count, 1);
    assert_eq!(journal.opened(), 1);
    assert_eq!(journal.closed(), 0);
}
