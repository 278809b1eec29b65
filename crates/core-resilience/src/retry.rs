//! Retry Executor: bounded retries with exponential backoff
//!
//! Wraps any fallible async operation and repeats it while the failure is
//! classified as retryable. Attempt `k` (1-indexed) that fails waits
//!
//! ```text
//! delay(k) = min(base_delay * backoff_factor^(k-1), max_delay)
//! ```
//!
//! optionally perturbed by `±jitter * delay(k)` (never below zero) before
//! attempt `k + 1`. A non-retryable failure aborts immediately; on exhaustion
//! the last failure is returned unchanged.
//!
//! The executor also keeps per-operation counters (attempts, successes,
//! failures, average attempts to success). They are informational only and
//! never influence control flow.
//!
//! # Example
//!
//! ```
//! use warden_core_resilience::retry::{RetryExecutor, RetryPolicy};
//! use warden_core_resilience::ResilienceError;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let executor = RetryExecutor::new();
//! let policy = RetryPolicy {
//!     max_attempts: 4,
//!     base_delay: Duration::from_millis(200),
//!     ..Default::default()
//! };
//!
//! let value = executor
//!     .execute("fetch-sms-code", &policy, || async {
//!         Ok::<_, ResilienceError>(42)
//!     })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::ResilienceError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Classification hook used by [`RetryExecutor::execute`]
pub trait Retryable {
    /// True when repeating the operation may succeed
    fn is_retryable(&self) -> bool;
}

/// Backoff and attempt limits for one logical operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Fraction of the delay used as symmetric random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, handy for deterministic schedules
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ResilienceError::InvalidPolicy(
                "backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ResilienceError::InvalidPolicy(
                "jitter must be within [0.0, 1.0)".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::InvalidPolicy(
                "base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-indexed), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_delay.as_secs_f64();
        let raw = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        // powi overflows to infinity long before u32::MAX attempts
        let capped = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay after failed attempt `attempt` with jitter applied
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_secs_f64() * self.jitter;
        let offset = rng.random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Per-operation counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Every invocation of the wrapped operation
    pub total_attempts: u64,
    /// Logical operations that eventually succeeded
    pub successes: u64,
    /// Logical operations that gave up
    pub failures: u64,
    /// Running mean of attempts needed by successful operations
    pub average_attempts_to_success: f64,
    /// Wall-clock time of the most recent attempt
    pub last_attempt: Option<SystemTime>,
}

/// Executes operations with bounded retries and exponential backoff
#[derive(Debug, Default)]
pub struct RetryExecutor {
    stats: Mutex<HashMap<String, RetryStats>>,
    cancel: Option<CancellationToken>,
}

impl RetryExecutor {
    /// Create an executor without cancellation support
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an executor whose backoff waits abort when `token` is cancelled.
    ///
    /// A cancelled wait ends the retry loop and returns the failure that
    /// triggered it.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            cancel: Some(token),
        }
    }

    /// Run `op`, retrying failures that report themselves as retryable
    pub async fn execute<F, Fut, T, E>(&self, name: &str, policy: &RetryPolicy, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_if(name, policy, |e: &E| e.is_retryable(), op)
            .await
    }

    /// Run `op`, retrying only failures accepted by `is_retryable`.
    ///
    /// This is the form used when the set of retryable failure kinds is
    /// chosen by the caller rather than by the error type.
    pub async fn execute_if<F, Fut, T, E, P>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.record_attempt(name);

            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "retry succeeded");
                    }
                    self.record_success(name, attempt);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                warn!(operation = name, attempt, error = %error, "non-retryable failure, giving up");
                self.record_failure(name);
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(operation = name, attempts = attempt, error = %error, "retries exhausted");
                self.record_failure(name);
                return Err(error);
            }

            let delay = policy.jittered_delay(attempt, &mut rand::rng());
            warn!(
                operation = name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );

            if let Some(token) = &self.cancel {
                tokio::select! {
                    _ = token.cancelled() => {
                        warn!(operation = name, attempt, "retry wait cancelled");
                        self.record_failure(name);
                        return Err(error);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Counters for one operation name
    pub fn stats(&self, name: &str) -> Option<RetryStats> {
        self.lock_stats().get(name).cloned()
    }

    /// Counters for every operation seen so far
    pub fn all_stats(&self) -> HashMap<String, RetryStats> {
        self.lock_stats().clone()
    }

    /// Forget all counters
    pub fn reset_stats(&self) {
        self.lock_stats().clear();
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryStats>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_attempt(&self, name: &str) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(name.to_string()).or_default();
        entry.total_attempts += 1;
        entry.last_attempt = Some(SystemTime::now());
    }

    fn record_success(&self, name: &str, attempts: u32) {
        let mut stats = self.lock_stats();
        let entry = stats.entry(name.to_string()).or_default();
        entry.successes += 1;
        let n = entry.successes as f64;
        entry.average_attempts_to_success += (attempts as f64 - entry.average_attempts_to_success) / n;
    }

    fn record_failure(&self, name: &str) {
        let mut stats = self.lock_stats();
        stats.entry(name.to_string()).or_default().failures += 1;
    }
}
