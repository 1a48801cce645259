//! Retry policy and error budget
//!
//! One shared policy wraps every transport call: retryable error classes
//! back off exponentially up to the attempt cap, non-retryable classes fail
//! immediately without consuming retry budget. Every failure, retryable or
//! not, counts against the sliding-window error budget; crossing the
//! threshold disables the adapter instance until an operator re-arms it.
//! Retries are sequential within the owning task, never concurrent.

use crate::config::EffectiveConfig;
use crate::error::{Error, ErrorClass, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-operation retry counters
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made by the most recent `execute`
    pub attempts: u32,
    /// Failures since the last success, across executes
    pub consecutive_failures: u32,
    /// Class of the most recent failure
    pub last_error_class: Option<ErrorClass>,
}

impl RetryState {
    /// Fresh state
    pub fn new() -> Self {
        Self::default()
    }

    fn record_failure(&mut self, class: ErrorClass) {
        self.consecutive_failures += 1;
        self.last_error_class = Some(class);
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Exponential-backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt cap (initial attempt included)
    pub max_attempts: u32,
    /// First retry delay
    pub retry_delay: Duration,
    /// Exponential factor applied per attempt
    pub backoff_multiplier: f64,
    /// Backoff cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Build from an effective configuration
    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            retry_delay: config.retry_delay,
            backoff_multiplier: config.backoff_multiplier,
            max_delay: config.max_retry_delay,
        }
    }

    /// Delay before the retry following the `attempt`-th failure (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = attempt.min(30);
        let base = self.retry_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped.saturating_sub(1) as i32);
        Duration::from_millis(base.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Run `operation`, retrying retryable failures with backoff.
    ///
    /// Non-retryable errors return immediately. Once the attempt cap is
    /// reached the last error is wrapped in [`Error::Exhausted`].
    pub async fn execute<T, F, Fut>(&self, state: &mut RetryState, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        state.attempts = 0;

        loop {
            state.attempts += 1;

            match operation().await {
                Ok(value) => {
                    state.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    state.record_failure(e.class());

                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if state.attempts >= self.max_attempts {
                        return Err(Error::Exhausted {
                            attempts: state.attempts,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = self.delay_for_attempt(state.attempts);
                    debug!(
                        "Retrying after {:?} (attempt {}/{}): {}",
                        delay, state.attempts, self.max_attempts, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct BudgetInner {
    failures: VecDeque<Instant>,
    tripped: bool,
}

/// Sliding-window failure counter per adapter instance.
///
/// Counts failing records/operations; crossing `max_threshold` within the
/// window trips the budget and the instance stays disabled until
/// [`re_arm`](ErrorBudget::re_arm).
#[derive(Debug)]
pub struct ErrorBudget {
    adapter_id: String,
    max_threshold: u64,
    window: Duration,
    inner: Mutex<BudgetInner>,
}

impl ErrorBudget {
    /// Create a budget for one adapter instance
    pub fn new(adapter_id: impl Into<String>, max_threshold: u64, window: Duration) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            max_threshold,
            window,
            inner: Mutex::new(BudgetInner::default()),
        }
    }

    /// Build from an effective configuration
    pub fn from_config(adapter_id: impl Into<String>, config: &EffectiveConfig) -> Self {
        Self::new(adapter_id, config.max_error_threshold, config.error_window)
    }

    /// Count `count` failing records/operations.
    ///
    /// Returns [`Error::ErrorBudgetExceeded`] at the moment the threshold
    /// is crossed (and on every call while still tripped).
    pub async fn record_failures(&self, count: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for _ in 0..count {
            inner.failures.push_back(now);
        }
        Self::prune(&mut inner, now, self.window);

        if inner.failures.len() as u64 > self.max_threshold {
            if !inner.tripped {
                warn!(
                    "Error budget exceeded for adapter {}: {} failures in {:?} window",
                    self.adapter_id,
                    inner.failures.len(),
                    self.window
                );
            }
            inner.tripped = true;
        }

        if inner.tripped {
            return Err(Error::ErrorBudgetExceeded {
                adapter_id: self.adapter_id.clone(),
                failures: inner.failures.len() as u64,
                window_secs: self.window.as_secs(),
            });
        }
        Ok(())
    }

    /// Whether the budget is currently tripped
    pub async fn is_tripped(&self) -> bool {
        self.inner.lock().await.tripped
    }

    /// Failures currently inside the window
    pub async fn failure_count(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        Self::prune(&mut inner, Instant::now(), self.window);
        inner.failures.len() as u64
    }

    /// Operator re-arm: clears the window and the tripped flag
    pub async fn re_arm(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures.clear();
        inner.tripped = false;
    }

    fn prune(inner: &mut BudgetInner, now: Instant, window: Duration) {
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
