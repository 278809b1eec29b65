//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker stops a single call-site from hammering a dependency that
//! is known to be failing. It has three states:
//! - Closed: Normal operation, calls pass through and failures are counted
//! - Open: The dependency is considered down, calls are rejected without running
//! - HalfOpen: The recovery timeout has elapsed and exactly one trial call is in flight
//!
//! A breaker is orthogonal to [`RetryExecutor`](crate::RetryExecutor): the breaker
//! limits calls to a known-bad dependency, the executor controls how often one
//! logical attempt is repeated.

use crate::error::{GuardError, ResilienceError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through normally
    Closed,
    /// Calls are rejected immediately
    Open,
    /// A single trial call is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial call is admitted
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidPolicy(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::InvalidPolicy(
                "recovery_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker, suitable for status output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub total_calls: u64,
    pub rejected_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_last_failure: Option<Duration>,
}

/// Circuit breaker protecting one named operation
///
/// # Example
///
/// ```
/// use warden_core_resilience::{CircuitBreaker, CircuitBreakerConfig, GuardError};
/// use std::time::Duration;
///
/// # async fn example() {
/// let breaker = CircuitBreaker::new(
///     "sms-provider",
///     CircuitBreakerConfig {
///         failure_threshold: 3,
///         recovery_timeout: Duration::from_secs(30),
///     },
/// );
///
/// match breaker.call(|| async { Ok::<_, String>("code") }).await {
///     Ok(code) => println!("got {}", code),
///     Err(GuardError::Open { retry_after, .. }) => println!("skip, retry in {:?}", retry_after),
///     Err(GuardError::Inner(e)) => println!("provider failed: {}", e),
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Create a breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as stored. An open breaker whose recovery timeout has
    /// elapsed still reports `Open` until the next call admits a trial.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            since_last_failure: inner.last_failure.map(|t| t.elapsed()),
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Returns `GuardError::Open` without invoking `op` while the circuit is open
    /// (or while another call holds the half-open trial). Any `Err` from `op`
    /// counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_if(op, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors accepted by `counts_as_failure`
    /// move the breaker towards open. Other errors are passed through and treated
    /// as a healthy response from the dependency.
    pub async fn call_if<F, Fut, T, E, P>(
        &self,
        op: F,
        counts_as_failure: P,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let trial = match self.admit() {
            Ok(trial) => trial,
            Err(retry_after) => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, ?retry_after, "call rejected, circuit open");
                return Err(GuardError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        let mut pending = PendingCall {
            breaker: self,
            trial,
            settled: false,
        };

        match op().await {
            Ok(value) => {
                pending.settle(true);
                Ok(value)
            }
            Err(e) => {
                let failed = counts_as_failure(&e);
                pending.settle(!failed);
                Err(GuardError::Inner(e))
            }
        }
    }

    /// Admit a call. `Ok(true)` marks the half-open trial, `Err` carries the
    /// remaining wait while the circuit stays open.
    fn admit(&self) -> Result<bool, Duration> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.recovery_timeout);

                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    Ok(true)
                } else {
                    Err(self.config.recovery_timeout - elapsed)
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                info!(breaker = %self.name, "✅ trial succeeded, circuit closed");
            }
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        if trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
                warn!(breaker = %self.name, "trial failed, circuit re-opened");
            }
            return;
        }

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                recovery_timeout = ?self.config.recovery_timeout,
                "⚠️  circuit opened"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles an admitted call. A call dropped before completion (its future was
/// cancelled) counts as a failed trial so the breaker cannot stay half-open forever.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl PendingCall<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

/// Named breakers sharing one configuration
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
    }
}
