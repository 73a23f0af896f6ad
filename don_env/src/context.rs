//! Core environment context trait for DON components.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the registry, the DON
/// dispatcher and the node executions can run both against a live tokio
/// runtime and inside the deterministic simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` - paused tokio clock plus a seeded RNG
///
/// # Determinism
///
/// Registry timestamps and every timer in a dispatch are read through
/// `now()`/`sleep()`, so a paused clock fixes their order.
#[async_trait]
pub trait DonContext: Send + Sync + 'static {
    /// Returns the monotonic time elapsed since context creation.
    ///
    /// The registry uses this as its block timestamp for request timeouts
    /// and price feed staleness.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Node executions are spawned through this so that a simulation can
    /// keep them on its own scheduler.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
