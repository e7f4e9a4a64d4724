//! Virtual clock implementing SessionClock for deterministic runs.

use crate::SessionClock;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Virtual clock that only moves when advanced.
///
/// Clones share the same underlying time, so a test can hold one handle
/// while the synchronizer holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    /// Current virtual time (nanoseconds since creation)
    virtual_time_ns: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a new ManualClock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Sets the virtual time to a specific value.
    pub fn set(&self, time: Duration) {
        self.virtual_time_ns
            .store(time.as_nanos() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.virtual_time_ns.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        // Virtual sleep still has to let producer tasks run
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_time() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));

        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(1500));

        clock.set(Duration::from_millis(20));
        assert_eq!(clock.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_manual_clock_clone_shares_time() {
        let c1 = ManualClock::new();
        let c2 = c1.clone();

        c1.advance(Duration::from_secs(5));
        assert_eq!(c1.now(), c2.now());
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        clock.sleep(Duration::from_millis(7)).await;
        assert_eq!(clock.now(), Duration::from_millis(7));
    }
}
