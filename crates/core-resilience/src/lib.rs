//! Warden Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the two call-level building blocks the recovery engine
//! is assembled from:
//!
//! - **Retry Executor**: bounded retries with exponential backoff, jitter and
//!   per-operation statistics
//! - **Circuit Breaker**: three-state breaker that fails fast while a dependency
//!   is known to be down, with a single-trial half-open probe
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Error kinds, devices, workers or interventions
//! - Notification channels or persistence
//! - Process-wide pause and emergency-stop state
//!
//! Cancellation is the only external signal it understands, through
//! `tokio_util::sync::CancellationToken`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Automation flow                 │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Executor                    │  ← Repeat one logical attempt
//! │  (backoff, jitter, retryable filter)    │
//! └─────────────┬───────────────────────────┘
//!               │  each attempt
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (opens on threshold, trial probe)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External dependency
//!      (device link, SMS provider, OCR)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use warden_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new("link-server", CircuitBreakerConfig::default());
//! let executor = RetryExecutor::new();
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     base_delay: Duration::from_millis(500),
//!     ..Default::default()
//! };
//!
//! let value = executor
//!     .execute("link-handshake", &policy, || async {
//!         breaker
//!             .call(|| async { Ok::<_, ResilienceError>(42) })
//!             .await
//!             .map_err(ResilienceError::from)
//!     })
//!     .await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod error;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use error::{GuardError, ResilienceError};
pub use retry::{RetryExecutor, RetryPolicy, RetryStats, Retryable};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use warden_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    };
    pub use super::error::{GuardError, ResilienceError};
    pub use super::retry::{RetryExecutor, RetryPolicy, Retryable};
}
