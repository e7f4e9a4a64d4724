//! Core clock trait for rigsync sessions.

use async_trait::async_trait;
use std::time::Duration;

/// The central interface for time during a capture session.
///
/// This trait abstracts the "real world" so that the synchronizer can run
/// in both production (tokio) and deterministic replay/test environments.
///
/// # Implementations
///
/// - **Production**: `TokioClock` - wraps `tokio::time`
/// - **Virtual**: `ManualClock` - advanced by hand or by `sleep`
///
/// # Determinism
///
/// Stall timeouts are measured exclusively through `now()`, so a virtual
/// clock makes camera drops reproducible.
#[async_trait]
pub trait SessionClock: Send + Sync + 'static {
    /// Returns the monotonic time elapsed since the clock was created.
    fn now(&self) -> Duration;

    /// Suspends the caller for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In virtual time: advances the clock and yields to the scheduler
    async fn sleep(&self, duration: Duration);
}
