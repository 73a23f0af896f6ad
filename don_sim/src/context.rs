//! Simulation context implementing DonContext for deterministic runs.

use async_trait::async_trait;
use don_env::DonContext;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Simulation context backed by the tokio clock and a seeded RNG.
///
/// This implements `DonContext` using:
/// - The tokio clock, which the harness runs paused so that timers fire in
///   order without real waiting
/// - A seeded ChaCha8 RNG for deterministic nonce generation
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Context creation time on the tokio clock
    start: Instant,

    /// Deterministic RNG for per-request randomness
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Forks an independent RNG stream off the context RNG.
    ///
    /// Forks are reproducible as long as they are taken in the same order.
    pub fn fork_rng(&self) -> ChaCha8Rng {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        ChaCha8Rng::seed_from_u64(rng.next_u64())
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            start: self.start,
            rng: Arc::clone(&self.rng),
        }
    }
}

#[async_trait]
impl DonContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("spawning {}", name);
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.now(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_clock() {
        let ctx = SimContext::new(1);
        let clone = ctx.clone();
        ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(clone.now(), Duration::from_secs(30));
    }

    #[test]
    fn test_forked_rngs_reproducible() {
        let a = SimContext::new(7);
        let b = SimContext::new(7);

        let (mut a1, mut a2) = (a.fork_rng(), a.fork_rng());
        let (mut b1, mut b2) = (b.fork_rng(), b.fork_rng());

        assert_eq!(a1.next_u64(), b1.next_u64());
        assert_eq!(a2.next_u64(), b2.next_u64());
        assert_ne!(a.fork_rng().next_u64(), a.fork_rng().next_u64());
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }
}
