//! Core environment context trait for the session tick loop.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for time and task management.
///
/// This trait abstracts the "real world" so that the scheduler and the
/// network session can run in production (tokio) and in the deterministic
/// simulation harness with the same code.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - virtual clock advanced by `sleep()`
///
/// # Determinism
///
/// Think-time deadlines are measured exclusively against `now()`. A virtual
/// clock therefore makes every timeout decision reproducible.
#[async_trait]
pub trait SessionContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Think windows and deadlines are expressed on this clock.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp action records.
    ///
    /// In simulation, this is derived from virtual clock + a fixed epoch.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Seed the session id is derived from.
    ///
    /// The simulation harness returns its master seed; production contexts
    /// draw a fresh value per run.
    fn seed(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn wall_clock_ms(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Sleeps until `deadline` on this context's clock (no-op if already past).
    async fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline - now).await;
        }
    }
}
