//! Live-runtime `DonContext`.

use crate::DonContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// Context for running a DON on an ordinary tokio runtime.
///
/// `now()` reads the tokio clock, so a paused test runtime still controls
/// registry timestamps. Spawned node tasks run inside a span carrying
/// their name.
#[derive(Debug, Clone, Copy)]
pub struct TokioContext {
    started: Instant,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Creates a context ready to hand to a registry and a DON at once.
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
impl DonContext for TokioContext {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(tracing::debug_span!("task", task = name)));
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_follows_tokio_clock() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.sleep(Duration::from_secs(301)).await;
        assert_eq!(ctx.now(), Duration::from_secs(301));
        assert_eq!(ctx.seed(), 0);
    }

    #[tokio::test]
    async fn test_spawned_node_task_runs() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("node-0", async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }
}
