//! Token-bucket rate limiting for outbound calls
//!
//! Placed in front of targets with published rate limits (the social-API
//! style adapters). Refill is time based and thread safe; capacity is a
//! hard ceiling, a caller can never borrow ahead of it.

use crate::config::{EffectiveConfig, RateTier};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Token bucket gate with tiered refill
pub struct RateLimiter {
    tokens: AtomicU64,
    capacity: u64,
    refill: u64,
    tier: RateTier,
    last_refill: RwLock<Instant>,
    throttled_total: AtomicU64,
}

impl RateLimiter {
    /// Create a bucket with `capacity` tokens refilled at `refill` per tier period
    pub fn new(capacity: u64, refill: u64, tier: RateTier) -> Self {
        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
            refill,
            tier,
            last_refill: RwLock::new(Instant::now()),
            throttled_total: AtomicU64::new(0),
        }
    }

    /// Build from an effective configuration; `None` when disabled
    pub fn from_config(config: &EffectiveConfig) -> Option<Self> {
        if !config.rate_limit_enabled {
            return None;
        }
        Some(Self::new(
            config.rate_limit_capacity,
            config.rate_limit_refill,
            config.rate_limit_tier,
        ))
    }

    /// Take one token, waiting up to `deadline`.
    ///
    /// Returns [`Error::RateLimited`] once the deadline elapses without a
    /// token; the caller's retry policy decides whether to wait-and-retry.
    pub async fn acquire(&self, deadline: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            self.refill_tokens().await;

            if self.take_one() {
                return Ok(());
            }

            let waited = start.elapsed();
            if waited >= deadline {
                self.throttled_total.fetch_add(1, Ordering::Relaxed);
                debug!("Rate limiter deadline elapsed after {:?}", waited);
                return Err(Error::RateLimited {
                    waited_ms: waited.as_millis() as u64,
                });
            }

            // Wait roughly one token's worth, bounded by the remaining deadline
            let per_token = self.tier.period().as_secs_f64() / self.refill.max(1) as f64;
            let wait = Duration::from_secs_f64(per_token.min(1.0)).min(deadline - waited);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Take one token without waiting
    pub async fn try_acquire(&self) -> bool {
        self.refill_tokens().await;
        self.take_one()
    }

    fn take_one(&self) -> bool {
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            // CAS lost, retry
        }
    }

    async fn refill_tokens(&self) {
        if self.refill == 0 {
            return;
        }

        let mut last = self.last_refill.write().await;
        let elapsed = last.elapsed();
        let to_add =
            (elapsed.as_secs_f64() / self.tier.period().as_secs_f64() * self.refill as f64) as u64;

        if to_add > 0 {
            // CAS update so a token taken concurrently is never resurrected
            let _ = self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_add(to_add).min(self.capacity))
                });
            *last = Instant::now();
        }
    }

    /// Tokens currently available
    pub fn available_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Calls rejected at their deadline so far
    pub fn throttled_total(&self) -> u64 {
        self.throttled_total.load(Ordering::Relaxed)
    }
}
