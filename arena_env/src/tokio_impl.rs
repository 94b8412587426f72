//! Real-time SessionContext on the Tokio runtime.

use crate::SessionContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::Instrument;

/// Wall-clock context for the headless server and the interactive client.
///
/// Tick deadlines are anchored to the instant the context was created, so a
/// slow tick shortens the next sleep instead of shifting every later tick.
pub struct TokioContext {
    /// Origin of `now()`
    start: Instant,

    /// Per-run value, only used to derive the session id
    seed: u64,
}

impl TokioContext {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self::with_seed(seed)
    }

    /// Context whose session id is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            start: Instant::now(),
            seed,
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, deadline: Duration) {
        tokio::time::sleep_until(self.start + deadline).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("task", name = %name);
        tokio::spawn(future.instrument(span));
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_sleep_until_is_anchored_to_start() {
        let ctx = TokioContext::new();
        ctx.sleep(Duration::from_millis(5)).await;
        // Deadline already behind us: returns at once
        ctx.sleep_until(Duration::from_millis(1)).await;
        ctx.sleep_until(Duration::from_millis(20)).await;
        assert!(ctx.now() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_drives_deadlines() {
        let ctx = TokioContext::with_seed(3);
        ctx.sleep_until(Duration::from_secs(150)).await;
        assert!(ctx.now() >= Duration::from_secs(150));
        assert_eq!(ctx.seed(), 3);
    }

    #[test]
    fn test_unseeded_contexts_differ() {
        let ctx = TokioContext::new();
        assert_ne!(ctx.seed(), 0);
        assert!(ctx.wall_clock_ms() > 0);
    }
}
