//! Pool shutdown.
//!
//! [`drain`] moves a pool from live to empty. The ended flag is set first and
//! the raw pool is closed right after, so every acquisition that starts
//! afterwards is refused and callers already queued for a connection are
//! turned away without opening one. Idle connections are
//! force-terminated only while nothing is checked out; active connections are
//! left to finish and are removed when they come back.
//!
//! The removal channel is subscribed *before* the counters are re-checked, so a
//! removal that lands between the check and the wait cannot be missed. A
//! connection parked idle by a lease that raced `end()` fires no removal; the
//! lifecycle's return signal covers that case.

use crate::db::lifecycle::PoolLifecycle;
use crate::db::raw_pool::RawPool;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

fn active_count<P: RawPool + ?Sized>(pool: &P) -> usize {
    pool.total_count().saturating_sub(pool.idle_count())
}

/// Mark the pool ended and wait until it owns no connection.
///
/// Returns without suspending when the pool is already empty or holds only
/// idle connections.
pub async fn drain<P: RawPool + ?Sized>(pool: &P, lifecycle: &PoolLifecycle) {
    if lifecycle.mark_ended() {
        info!("Pool marked as ended");
    }
    pool.close();

    if active_count(pool) == 0 {
        let removed = pool.terminate_idle();
        debug!(removed, "Terminated idle connections");
    }

    let mut removals = pool.subscribe_removals();

    loop {
        let returned = lifecycle.returned();

        if pool.total_count() == 0 {
            return;
        }

        if active_count(pool) == 0 {
            let removed = pool.terminate_idle();
            if removed > 0 {
                debug!(removed, "Terminated idle connections");
                continue;
            }
        }

        debug!(
            total = pool.total_count(),
            active = active_count(pool),
            "Waiting for active connections"
        );
        tokio::select! {
            event = removals.recv() => match event {
                Ok(event) => debug!(connection_id = event.connection_id, "Connection removed"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Removal notifications lagged"),
                // The raw pool is gone, and its connections with it.
                Err(RecvError::Closed) => return,
            },
            () = returned => debug!("Connection returned idle during shutdown"),
        }
    }
}
