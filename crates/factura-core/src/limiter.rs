use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ExtractError;

/// Configuration for the remote-call concurrency bound.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Simultaneous in-flight extractions. Kept small to stay under
    /// remote-service rate limits.
    pub max_concurrent: usize,
    /// Per-acquisition stagger delay, multiplied by queue position
    /// modulo the ceiling. `Duration::ZERO` disables staggering.
    pub stagger: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_concurrent: cores.clamp(3, 8),
            stagger: Duration::from_millis(100),
        }
    }
}

impl LimiterConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            stagger: Duration::ZERO,
        }
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }
}

/// Bounds simultaneous extraction work against remote services.
///
/// Every unit must hold a permit before contacting a remote collaborator;
/// cache hits bypass the controller entirely. Permits release on drop, so
/// a failed unit can never leak capacity.
#[derive(Clone)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    limit: usize,
    stagger: Duration,
    seq: Arc<AtomicUsize>,
}

impl ConcurrencyController {
    pub fn new(config: LimiterConfig) -> Self {
        let limit = config.max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            stagger: config.stagger,
            seq: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a permit, then stagger briefly to smooth bursts against
    /// the remote rate limiter.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ExtractError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExtractError::Generic("concurrency limiter closed".into()))?;

        if !self.stagger.is_zero() {
            let position = self.seq.fetch_add(1, Ordering::Relaxed) % self.limit;
            if position > 0 {
                tokio::time::sleep(self.stagger * position as u32).await;
            }
        }
        Ok(permit)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
