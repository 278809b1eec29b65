/*!
 * Warden - fault tolerance and recovery for long-running automation
 *
 * Collaborators (device links, browser workers, network tunnels) report
 * failures to a recovery coordinator which:
 * - Correlates repeated reports into one error event
 * - Runs a per-kind recovery handler with backoff between attempts
 * - Guards collaborator calls with named circuit breakers
 * - Pauses the whole system when failures cluster
 * - Escalates exhausted failures to a prioritized human intervention queue
 * - Broadcasts every escalation and state change to notification channels
 *
 * A watchdog loop health-checks components on its own schedule and
 * restarts them within a bounded number of attempts.
 */

pub mod admin;
pub mod audit;
pub mod capabilities;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod intervention;
pub mod logging;
pub mod model;
pub mod notification;
pub mod watchdog;

// Re-export commonly used types
pub use admin::{AdminInterface, AdminResponse};
pub use capabilities::{Capability, CommandRemediation, Remediation};
pub use config::WardenConfig;
pub use coordinator::{RecoveryCoordinator, RecoveryHandler, RecoveryOutcome, SystemStatus};
pub use error::{Result, WardenError};
pub use intervention::{InterventionQueue, InterventionRequest, InterventionStatus};
pub use model::{ErrorEvent, ErrorKind, ErrorReport, Priority, RecoveryStrategy, SystemState};
pub use notification::{Notification, NotificationChannel, NotificationFanout};
pub use watchdog::{Watchdog, WatchedComponent};

pub use warden_core_resilience::{CircuitBreaker, CircuitState, RetryExecutor, RetryPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
