//! Pool lifecycle state.
//!
//! One [`PoolLifecycle`] is created per raw pool and shared (via `Arc`) by every
//! handle and lease built on that pool. `ended` moves from `false` to `true`
//! exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, futures::Notified};

#[derive(Debug, Default)]
pub struct PoolLifecycle {
    ended: AtomicBool,
    /// Signalled when a connection is parked idle while shutdown is running.
    returned: Notify,
}

impl PoolLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the pool as ended.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn mark_ended(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }

    /// Whether shutdown has been requested.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Wake shutdown waiters after a connection went back to the idle set.
    ///
    /// A lease that checked the flag just before `end()` set it parks its
    /// connection idle instead of discarding it; no removal fires for that.
    pub(crate) fn notify_returned(&self) {
        self.returned.notify_waiters();
    }

    /// Future completing on the next [`notify_returned`](Self::notify_returned).
    /// Registered as soon as it is created.
    pub(crate) fn returned(&self) -> Notified<'_> {
        self.returned.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_starts_live() {
        assert!(!PoolLifecycle::new().is_ended());
    }

    #[test]
    fn test_mark_ended_transitions_once() {
        let lifecycle = PoolLifecycle::new();
        assert!(lifecycle.mark_ended());
        assert!(lifecycle.is_ended());
        assert!(!lifecycle.mark_ended());
        assert!(lifecycle.is_ended());
    }

    #[test]
    fn test_returned_wakes_registered_waiter() {
        let lifecycle = PoolLifecycle::new();
        let waiter = lifecycle.returned();
        lifecycle.notify_returned();
        assert!(waiter.now_or_never().is_some());
    }
}
