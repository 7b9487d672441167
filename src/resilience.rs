// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: Exponential backoff for replication loops after errors
//! - [`RateLimiter`]: Token bucket shared by every task's remote calls
//! - [`Bulkhead`]: Bounds concurrent task start/stop jobs
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), channel_hub::resilience::BulkheadFull> {
//! use channel_hub::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Waits if over limit
//!
//! let bulkhead = Bulkhead::new(20);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff schedule for a loop that retries forever.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first consecutive failure.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Multiplier applied per consecutive failure.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// ```text
    /// Failure  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 7+       60s
    /// ```
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given consecutive failure count (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi(attempt.saturating_sub(1).min(64) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket parameters.
///
/// Tokens refill at `refill_rate` per second, up to `burst_size` tokens.
/// Each remote call consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 1000 calls/sec with a burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// One limiter is shared by every replication task on a node so a reconcile
/// pass that starts hundreds of tasks does not stampede the remote peers.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Zero rates are raised to one token.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Wait until a token is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when the bulkhead has been closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits how many operations run at once.
///
/// The reconciler runs every task start/stop job under a permit so a pass
/// over thousands of channels opens at most `max_concurrent` connections.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// The permit is owned, so it can be moved into a spawned job and
    /// releases the slot when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Refuse all future acquisitions. Waiters get [`BulkheadFull`].
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_delay_for_huge_attempt_does_not_overflow() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(u32::MAX), config.max_delay);
    }

    // =========================================================================
    // Rate Limiter Tests
    // =========================================================================

    #[tokio::test]
    async fn test_rate_limiter_burst_then_waits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });

        let burst = tokio::time::timeout(Duration::from_millis(100), async {
            for _ in 0..3 {
                limiter.acquire().await;
            }
        })
        .await;
        assert!(burst.is_ok(), "burst should not wait");

        let fourth = tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(fourth.is_err(), "should wait for a refill after the burst");
    }

    #[tokio::test]
    async fn test_rate_limiter_zero_config_still_admits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        let first = tokio::time::timeout(Duration::from_millis(100), limiter.acquire()).await;
        assert!(first.is_ok());
    }

    // =========================================================================
    // Bulkhead Tests
    // =========================================================================

    #[tokio::test]
    async fn test_bulkhead_acquire_waits() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let bulkhead2 = Arc::clone(&bulkhead);

        let permit = bulkhead.acquire().await.unwrap();

        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            let _p = bulkhead2.acquire().await.unwrap();
            start.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(permit);

        let wait_time = handle.await.unwrap();
        assert!(wait_time >= Duration::from_millis(40), "should have waited");
    }

    #[tokio::test]
    async fn test_bulkhead_close_rejects_waiters() {
        let bulkhead = Arc::new(Bulkhead::new(1));
        let _held = bulkhead.acquire().await.unwrap();

        let waiting = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bulkhead.close();

        assert!(waiting.await.unwrap().is_err());
        let err = bulkhead.acquire().await.unwrap_err();
        assert_eq!(err.to_string(), "bulkhead full: max 1 concurrent operations");
    }
}
