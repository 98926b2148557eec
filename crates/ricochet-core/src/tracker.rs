//! In-flight task tracking for graceful proxy shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Counts in-flight connections so a proxy can drain before stopping.
#[derive(Clone)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    zero_notify: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            zero_notify: Arc::new(Notify::new()),
        }
    }

    /// Register a new in-flight connection and return its drop guard.
    pub fn guard(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    fn decrement(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero_notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no connections remain, up to `timeout`.
    ///
    /// Returns `true` when drained, `false` on deadline.
    pub async fn wait_for_zero(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = self.zero_notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return self.count() == 0,
            }
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the tracker when dropped.
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_to_zero() {
        let tracker = ConnectionTracker::new();
        let g1 = tracker.guard();
        let g2 = tracker.guard();
        assert_eq!(tracker.count(), 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_zero(Duration::from_secs(1)).await })
        };
        drop(g1);
        drop(g2);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn deadline_without_drain() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.guard();
        assert!(!tracker.wait_for_zero(Duration::from_millis(20)).await);
    }
}
