/*!
 * Error Model: failure taxonomy, recovery strategies and system state
 *
 * Everything in this module is plain data. Behavior that depends on these
 * types (dispatch, escalation, restarts) lives in the coordinator, the
 * intervention queue and the watchdog.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Free-form context attached to a failure report
pub type Context = BTreeMap<String, serde_json::Value>;

/// Returned when a string names no known variant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {what}: '{value}'")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Kind of failure reported by an automation collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    LinkLost,
    VpnFailure,
    ProxyFailure,
    VerificationTimeout,
    SecurityChallenge,
    DeviceOffline,
    NetworkError,
    MemoryPressure,
    CaptchaChallenge,
    RateLimited,
    WorkerCrashed,
    SystemOverload,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::LinkLost,
        ErrorKind::VpnFailure,
        ErrorKind::ProxyFailure,
        ErrorKind::VerificationTimeout,
        ErrorKind::SecurityChallenge,
        ErrorKind::DeviceOffline,
        ErrorKind::NetworkError,
        ErrorKind::MemoryPressure,
        ErrorKind::CaptchaChallenge,
        ErrorKind::RateLimited,
        ErrorKind::WorkerCrashed,
        ErrorKind::SystemOverload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LinkLost => "link-lost",
            ErrorKind::VpnFailure => "vpn-failure",
            ErrorKind::ProxyFailure => "proxy-failure",
            ErrorKind::VerificationTimeout => "verification-timeout",
            ErrorKind::SecurityChallenge => "security-challenge",
            ErrorKind::DeviceOffline => "device-offline",
            ErrorKind::NetworkError => "network-error",
            ErrorKind::MemoryPressure => "memory-pressure",
            ErrorKind::CaptchaChallenge => "captcha-challenge",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::WorkerCrashed => "worker-crashed",
            ErrorKind::SystemOverload => "system-overload",
        }
    }

    /// Strategy assigned when configuration does not override it
    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorKind::LinkLost | ErrorKind::DeviceOffline | ErrorKind::WorkerCrashed => {
                RecoveryStrategy::ComponentRestart
            }
            ErrorKind::VpnFailure | ErrorKind::ProxyFailure => RecoveryStrategy::SimpleRetry,
            ErrorKind::VerificationTimeout | ErrorKind::NetworkError | ErrorKind::RateLimited => {
                RecoveryStrategy::ExponentialBackoff
            }
            ErrorKind::SecurityChallenge | ErrorKind::CaptchaChallenge => {
                RecoveryStrategy::ManualIntervention
            }
            ErrorKind::MemoryPressure | ErrorKind::SystemOverload => RecoveryStrategy::SystemPause,
        }
    }

    /// Kinds that automated retry cannot resolve; they escalate on first report
    pub fn is_manual_only(&self) -> bool {
        matches!(
            self,
            ErrorKind::SecurityChallenge | ErrorKind::CaptchaChallenge
        )
    }

    /// Kinds whose handling always pauses the system while cleaning up
    pub fn is_systemic(&self) -> bool {
        matches!(self, ErrorKind::MemoryPressure | ErrorKind::SystemOverload)
    }

    pub fn intervention_type(&self) -> InterventionType {
        match self {
            ErrorKind::SecurityChallenge => InterventionType::Security,
            ErrorKind::CaptchaChallenge => InterventionType::Captcha,
            ErrorKind::VerificationTimeout => InterventionType::Verification,
            ErrorKind::MemoryPressure | ErrorKind::SystemOverload => InterventionType::Emergency,
            ErrorKind::VpnFailure | ErrorKind::ProxyFailure | ErrorKind::RateLimited => {
                InterventionType::Configuration
            }
            ErrorKind::LinkLost
            | ErrorKind::DeviceOffline
            | ErrorKind::WorkerCrashed
            | ErrorKind::NetworkError => InterventionType::Maintenance,
        }
    }

    pub fn escalation_priority(&self) -> Priority {
        match self {
            ErrorKind::SecurityChallenge => Priority::Urgent,
            ErrorKind::CaptchaChallenge
            | ErrorKind::MemoryPressure
            | ErrorKind::LinkLost
            | ErrorKind::DeviceOffline
            | ErrorKind::WorkerCrashed => Priority::High,
            _ => Priority::Medium,
        }
    }

    /// How long an operator has to act on an escalated failure of this kind
    pub fn escalation_timeout(&self) -> Duration {
        let minutes = match self {
            ErrorKind::SecurityChallenge => 30,
            ErrorKind::CaptchaChallenge => 15,
            ErrorKind::SystemOverload => 120,
            _ => 60,
        };
        Duration::from_secs(minutes * 60)
    }

    /// Map a free-text failure message onto a kind.
    ///
    /// Rules are checked in order, so the more specific ones come first.
    /// Returns `None` when no rule matches.
    pub fn classify(message: &str) -> Option<ErrorKind> {
        const RULES: &[(&[&str], ErrorKind)] = &[
            (
                &["out of memory", "oom", "memory pressure", "cannot allocate"],
                ErrorKind::MemoryPressure,
            ),
            (
                &["overload", "cpu usage", "load average", "too many tasks"],
                ErrorKind::SystemOverload,
            ),
            (&["captcha", "i'm not a robot", "recaptcha"], ErrorKind::CaptchaChallenge),
            (
                &["unusual activity", "security check", "suspicious", "verify it's you"],
                ErrorKind::SecurityChallenge,
            ),
            (
                &["429", "rate limit", "too many requests", "quota"],
                ErrorKind::RateLimited,
            ),
            (
                &["verification code", "sms timeout", "code not received", "otp"],
                ErrorKind::VerificationTimeout,
            ),
            (&["vpn", "tunnel"], ErrorKind::VpnFailure),
            (&["proxy"], ErrorKind::ProxyFailure),
            (
                &["device offline", "device not found", "unauthorized device", "no devices"],
                ErrorKind::DeviceOffline,
            ),
            (
                &["link lost", "link server", "broken link", "adb server"],
                ErrorKind::LinkLost,
            ),
            (
                &["worker crashed", "worker died", "worker exited", "panicked"],
                ErrorKind::WorkerCrashed,
            ),
            (
                &[
                    "connection refused",
                    "connection reset",
                    "timed out",
                    "dns",
                    "network",
                    "unreachable",
                ],
                ErrorKind::NetworkError,
            ),
        ];

        let lower = message.to_lowercase();
        RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| contains_word(&lower, n)))
            .map(|(_, kind)| *kind)
    }
}

/// Substring match that refuses to match inside a longer alphanumeric word,
/// so "oom" does not match "room" and "otp" does not match "hotpot".
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
    })
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        ErrorKind::ALL
            .iter()
            .find(|k| k.as_str() == normalized)
            .copied()
            .ok_or_else(|| ParseEnumError::new("error kind", s))
    }
}

/// Policy class assigned to an error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    SimpleRetry,
    ExponentialBackoff,
    ComponentRestart,
    ManualIntervention,
    SystemPause,
    SkipAndContinue,
    Escalate,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::SimpleRetry => "simple-retry",
            RecoveryStrategy::ExponentialBackoff => "exponential-backoff",
            RecoveryStrategy::ComponentRestart => "component-restart",
            RecoveryStrategy::ManualIntervention => "manual-intervention",
            RecoveryStrategy::SystemPause => "system-pause",
            RecoveryStrategy::SkipAndContinue => "skip-and-continue",
            RecoveryStrategy::Escalate => "escalate",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide operating state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemState {
    #[default]
    Running,
    Paused,
    Recovering,
    Maintenance,
    EmergencyStop,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Running => "running",
            SystemState::Paused => "paused",
            SystemState::Recovering => "recovering",
            SystemState::Maintenance => "maintenance",
            SystemState::EmergencyStop => "emergency-stop",
        }
    }

    /// Only a running system invokes handlers
    pub fn accepts_work(&self) -> bool {
        matches!(self, SystemState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SystemState::EmergencyStop)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operator is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterventionType {
    Verification,
    Captcha,
    Security,
    Maintenance,
    Configuration,
    Emergency,
}

impl InterventionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionType::Verification => "verification",
            InterventionType::Captcha => "captcha",
            InterventionType::Security => "security",
            InterventionType::Maintenance => "maintenance",
            InterventionType::Configuration => "configuration",
            InterventionType::Emergency => "emergency",
        }
    }
}

impl fmt::Display for InterventionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five-level intervention priority; derives `Ord` so `Critical` is greatest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
        Priority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        }
    }

    /// 1 (low) through 5 (critical)
    pub fn level(&self) -> u8 {
        *self as u8 + 1
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        if let Ok(level) = normalized.parse::<u8>() {
            return Priority::ALL
                .iter()
                .find(|p| p.level() == level)
                .copied()
                .ok_or_else(|| ParseEnumError::new("priority", s));
        }
        Priority::ALL
            .iter()
            .find(|p| p.as_str() == normalized)
            .copied()
            .ok_or_else(|| ParseEnumError::new("priority", s))
    }
}

/// Ingress payload: one failure as reported by a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            component: component.into(),
            context: Context::new(),
            device_id: None,
            worker_id: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Key used to correlate repeated reports of the same failure
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: self.kind,
            component: self.component.clone(),
            device_id: self.device_id.clone(),
            worker_id: self.worker_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: ErrorKind,
    pub component: String,
    pub device_id: Option<String>,
    pub worker_id: Option<String>,
}

/// One recorded failure with its attempt history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: Context,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub strategy: RecoveryStrategy,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set once the event has been handed to an operator
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervention_id: Option<String>,
    /// Most recent handler failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of times the failure was reported, including reports while paused
    #[serde(default)]
    pub occurrences: u32,
}

impl ErrorEvent {
    pub fn from_report(report: &ErrorReport, strategy: RecoveryStrategy, max_attempts: u32) -> Self {
        Self {
            id: format!("err-{}", Uuid::new_v4()),
            kind: report.kind,
            timestamp: Utc::now(),
            component: report.component.clone(),
            device_id: report.device_id.clone(),
            worker_id: report.worker_id.clone(),
            message: report.message.clone(),
            context: report.context.clone(),
            attempt_count: 0,
            max_attempts,
            strategy,
            resolved: false,
            resolved_at: None,
            escalated: false,
            intervention_id: None,
            last_error: None,
            occurrences: 1,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: self.kind,
            component: self.component.clone(),
            device_id: self.device_id.clone(),
            worker_id: self.worker_id.clone(),
        }
    }

    /// Neither resolved nor handed to an operator
    pub fn is_open(&self) -> bool {
        !self.resolved && !self.escalated
    }

    /// Attempts left before the next failure escalates
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    pub fn mark_resolved(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.resolved_at = Some(Utc::now());
        }
    }
}

/// Result of one health check; rebuilt every watchdog cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub component: String,
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl HealthStatus {
    pub fn healthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: true,
            timestamp: Utc::now(),
            message: message.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            ..Self::healthy(component, message)
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_strings() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>(), Ok(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!("DEVICE_OFFLINE".parse::<ErrorKind>(), Ok(ErrorKind::DeviceOffline));
        assert!("disk-on-fire".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_default_strategies() {
        assert_eq!(
            ErrorKind::DeviceOffline.default_strategy(),
            RecoveryStrategy::ComponentRestart
        );
        assert_eq!(
            ErrorKind::ProxyFailure.default_strategy(),
            RecoveryStrategy::SimpleRetry
        );
        assert_eq!(
            ErrorKind::RateLimited.default_strategy(),
            RecoveryStrategy::ExponentialBackoff
        );
        assert_eq!(
            ErrorKind::CaptchaChallenge.default_strategy(),
            RecoveryStrategy::ManualIntervention
        );
        assert_eq!(
            ErrorKind::SystemOverload.default_strategy(),
            RecoveryStrategy::SystemPause
        );
    }

    #[test]
    fn test_escalation_rules() {
        assert_eq!(ErrorKind::SecurityChallenge.escalation_priority(), Priority::Urgent);
        assert_eq!(
            ErrorKind::SecurityChallenge.escalation_timeout(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(
            ErrorKind::CaptchaChallenge.escalation_timeout(),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(ErrorKind::SystemOverload.escalation_priority(), Priority::Medium);
        assert_eq!(
            ErrorKind::DeviceOffline.intervention_type(),
            InterventionType::Maintenance
        );
        assert!(ErrorKind::CaptchaChallenge.is_manual_only());
        assert!(ErrorKind::MemoryPressure.is_systemic());
        assert!(!ErrorKind::NetworkError.is_systemic());
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            ErrorKind::classify("Worker 3: Out of memory while rendering"),
            Some(ErrorKind::MemoryPressure)
        );
        assert_eq!(
            ErrorKind::classify("HTTP 429 Too Many Requests"),
            Some(ErrorKind::RateLimited)
        );
        assert_eq!(
            ErrorKind::classify("reCAPTCHA shown on signup page"),
            Some(ErrorKind::CaptchaChallenge)
        );
        assert_eq!(
            ErrorKind::classify("error: device not found"),
            Some(ErrorKind::DeviceOffline)
        );
        assert_eq!(
            ErrorKind::classify("connection reset by peer"),
            Some(ErrorKind::NetworkError)
        );
        assert_eq!(ErrorKind::classify("the room is quiet"), None);
        assert_eq!(ErrorKind::classify("form submitted"), None);
    }

    #[test]
    fn test_priority_ordering_and_parsing() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!("URGENT".parse::<Priority>(), Ok(Priority::Urgent));
        assert_eq!("5".parse::<Priority>(), Ok(Priority::Critical));
        assert_eq!(Priority::Low.level(), 1);
        assert!("asap".parse::<Priority>().is_err());
        assert!("9".parse::<Priority>().is_err());
    }

    #[test]
    fn test_event_resolution_sets_timestamp() {
        let report = ErrorReport::new(ErrorKind::LinkLost, "link", "link dropped")
            .with_device("emulator-5554");
        let mut event = ErrorEvent::from_report(&report, RecoveryStrategy::ComponentRestart, 3);

        assert!(event.id.starts_with("err-"));
        assert!(event.is_open());
        assert_eq!(event.fingerprint(), report.fingerprint());
        assert!(event.resolved_at.is_none());

        event.mark_resolved();
        assert!(event.resolved);
        assert!(event.resolved_at.is_some());
        assert!(!event.is_open());
    }

    #[test]
    fn test_health_status_builders() {
        let status = HealthStatus::unhealthy("link-server", "no heartbeat").with_metric("latency_ms", 812.0);
        assert!(!status.healthy);
        assert_eq!(status.metrics.get("latency_ms"), Some(&812.0));
    }

    #[test]
    fn test_system_state_predicates() {
        assert!(SystemState::Running.accepts_work());
        assert!(!SystemState::Maintenance.accepts_work());
        assert!(SystemState::EmergencyStop.is_terminal());
        assert_eq!(SystemState::default(), SystemState::Running);
    }
}
