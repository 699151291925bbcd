//! Transaction execution with bounded retry.
//!
//! Each attempt moves `Started -> Committed` or `Started -> RolledBack`.
//! A body or COMMIT failure classified as retryable
//! ([`DbError::is_transaction_retryable`]) restarts the whole attempt while
//! fewer than `retry_limit` retries have been spent, so a transaction runs at
//! most `1 + retry_limit` times. The last failure is returned unchanged.

use crate::db::bound::BoundConnection;
use crate::db::raw_pool::RawPool;
use crate::error::{DbError, DbResult};
use crate::models::TransactionState;
use futures_util::future::BoxFuture;
use tracing::{debug, error, warn};

/// Why an attempt failed.
enum AttemptError {
    /// The transaction was rolled back and may be re-run.
    Retryable(DbError),
    Fatal(DbError),
}

impl AttemptError {
    fn classify(err: DbError) -> Self {
        if err.is_transaction_retryable() {
            Self::Retryable(err)
        } else {
            Self::Fatal(err)
        }
    }
}

pub(crate) async fn run_transaction<P, T, F>(
    bound: &BoundConnection<P>,
    mut handler: F,
    retry_limit: u32,
) -> DbResult<T>
where
    P: RawPool,
    T: Send,
    F: for<'c> FnMut(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match run_attempt(bound, &mut handler, attempt).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Retryable(e)) if attempt <= retry_limit => {
                warn!(attempt, retry_limit, error = %e, "Retrying transaction");
            }
            Err(AttemptError::Retryable(e) | AttemptError::Fatal(e)) => return Err(e),
        }
    }
}

async fn run_attempt<P, T, F>(
    bound: &BoundConnection<P>,
    handler: &mut F,
    attempt: u32,
) -> Result<T, AttemptError>
where
    P: RawPool,
    T: Send,
    F: for<'c> FnMut(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
{
    bound.execute("BEGIN").await.map_err(AttemptError::Fatal)?;
    bound.set_transaction_open(true);
    let _depth = bound.enter_transaction();
    debug!(attempt, state = %TransactionState::Started, "Transaction");

    let value = match handler(bound).await {
        Ok(value) => value,
        Err(e) => {
            rollback(bound).await?;
            debug!(attempt, state = %TransactionState::RolledBack, error = %e, "Transaction");
            return Err(AttemptError::classify(e));
        }
    };

    match bound.execute("COMMIT").await {
        Ok(()) => {
            bound.set_transaction_open(false);
            debug!(attempt, state = %TransactionState::Committed, "Transaction");
            Ok(value)
        }
        Err(e) => {
            // Some backends leave the transaction open after a failed COMMIT.
            rollback(bound).await?;
            debug!(attempt, state = %TransactionState::RolledBack, error = %e, "Commit failed");
            Err(AttemptError::classify(e))
        }
    }
}

/// Roll back the open transaction. A failed rollback leaves the connection
/// in an unknown state, so it is marked broken and the rollback error wins.
async fn rollback<P: RawPool>(bound: &BoundConnection<P>) -> Result<(), AttemptError> {
    if let Err(e) = bound.execute("ROLLBACK").await {
        error!(error = %e, "Rollback failed");
        bound.mark_broken().await;
        return Err(AttemptError::Fatal(e));
    }
    bound.set_transaction_open(false);
    Ok(())
}

/// Run `handler` inside a savepoint of the transaction already open on `bound`.
pub(crate) async fn run_savepoint<P, T, F>(bound: &BoundConnection<P>, mut handler: F) -> DbResult<T>
where
    P: RawPool,
    T: Send,
    F: for<'c> FnMut(&'c BoundConnection<P>) -> BoxFuture<'c, DbResult<T>> + Send,
{
    let name = format!("savepoint_{}", bound.transaction_depth());
    bound.execute(&format!("SAVEPOINT {name}")).await?;
    let _depth = bound.enter_transaction();
    debug!(savepoint = %name, state = %TransactionState::Started, "Savepoint");

    match handler(bound).await {
        Ok(value) => {
            bound.execute(&format!("RELEASE SAVEPOINT {name}")).await?;
            debug!(savepoint = %name, state = %TransactionState::Committed, "Savepoint");
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = bound
                .execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .await
            {
                error!(savepoint = %name, error = %rollback_err, "Savepoint rollback failed");
                bound.mark_broken().await;
                return Err(rollback_err);
            }
            debug!(savepoint = %name, state = %TransactionState::RolledBack, error = %e, "Savepoint");
            Err(e)
        }
    }
}
