/*!
 * Error types for Warden
 *
 * Each module owns a focused error enum; `WardenError` unifies them at the
 * crate boundary.
 */

use std::fmt;
use std::io;
use thiserror::Error;

use crate::admin::AdminError;
use crate::audit::AuditError;
use crate::capabilities::CapabilityError;
use crate::config::ConfigError;
use crate::coordinator::RecoveryError;
use crate::intervention::InterventionError;
use crate::notification::NotifyError;
use crate::watchdog::WatchdogError;
use warden_core_resilience::ResilienceError;

pub type Result<T> = std::result::Result<T, WardenError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_STOPPED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Intervention(#[from] InterventionError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WardenError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            WardenError::Recovery(RecoveryError::EmergencyStopped) => EXIT_STOPPED,
            _ => EXIT_FATAL,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            WardenError::Config(_) => ErrorCategory::Configuration,
            WardenError::Recovery(_) | WardenError::Resilience(_) => ErrorCategory::Recovery,
            WardenError::Intervention(_) | WardenError::Admin(_) => ErrorCategory::Operator,
            WardenError::Notify(_) | WardenError::Audit(_) => ErrorCategory::Notification,
            WardenError::Watchdog(_) => ErrorCategory::Watchdog,
            WardenError::Capability(_) => ErrorCategory::Collaborator,
            WardenError::Io(_) => ErrorCategory::IoError,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Recovery,
    /// Intervention and admin command errors
    Operator,
    Notification,
    Watchdog,
    /// Remediation capability failures
    Collaborator,
    IoError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Recovery => write!(f, "recovery"),
            ErrorCategory::Operator => write!(f, "operator"),
            ErrorCategory::Notification => write!(f, "notification"),
            ErrorCategory::Watchdog => write!(f, "watchdog"),
            ErrorCategory::Collaborator => write!(f, "collaborator"),
            ErrorCategory::IoError => write!(f, "io"),
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
