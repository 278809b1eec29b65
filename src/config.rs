/*!
 * Configuration types for Warden
 *
 * Every section and field carries a serde default, so an empty file is a
 * valid configuration and a partial file only overrides what it names.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use warden_core_resilience::{CircuitBreakerConfig, RetryPolicy};

use crate::model::{ErrorKind, RecoveryStrategy};
use crate::watchdog::WatchdogPolicy;

/// Errors raised while loading, saving or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub watchdog: WatchdogPolicy,

    #[serde(default)]
    pub interventions: InterventionConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

impl WardenConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `$XDG_CONFIG_HOME/warden/warden.toml` (or the platform equivalent)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("warden").join("warden.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recovery.validate().map_err(ConfigError::Invalid)?;
        self.breaker
            .to_breaker_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.watchdog.validate().map_err(ConfigError::Invalid)?;
        self.interventions.validate().map_err(ConfigError::Invalid)?;
        self.notifications.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

/// Per-kind override under `[recovery.kinds.<kind>]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RecoveryStrategy>,
}

/// Effective policy for one error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    pub max_attempts: u32,
    pub strategy: RecoveryStrategy,
}

/// Recovery coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Unsuccessful attempts allowed before an error escalates
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of each backoff delay used as random jitter
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Events retained in the history ring buffer
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Events included in `status`
    #[serde(default = "default_recent_events")]
    pub recent_events: usize,

    /// Deadline for a single handler invocation
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,

    /// Pause when this many consecutive reports share a kind
    #[serde(default = "default_pattern_same_kind")]
    pub pattern_same_kind: usize,

    /// Pause when this many reports land inside the window
    #[serde(default = "default_pattern_window_count")]
    pub pattern_window_count: usize,

    #[serde(default = "default_pattern_window_secs")]
    pub pattern_window_secs: u64,

    /// Wait used by simple-retry handlers before acting
    #[serde(default = "default_short_retry_delay_ms")]
    pub short_retry_delay_ms: u64,

    /// Cool-down for verification-timeout and rate-limited handlers
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Cool-down for memory-pressure and system-overload handlers
    #[serde(default = "default_systemic_cooldown_secs")]
    pub systemic_cooldown_secs: u64,

    #[serde(default)]
    pub kinds: BTreeMap<String, KindOverride>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_history_capacity() -> usize {
    1_000
}

fn default_recent_events() -> usize {
    10
}

fn default_handler_timeout_secs() -> u64 {
    30
}

fn default_pattern_same_kind() -> usize {
    5
}

fn default_pattern_window_count() -> usize {
    10
}

fn default_pattern_window_secs() -> u64 {
    300
}

fn default_short_retry_delay_ms() -> u64 {
    2_000
}

fn default_cooldown_secs() -> u64 {
    20
}

fn default_systemic_cooldown_secs() -> u64 {
    60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            history_capacity: default_history_capacity(),
            recent_events: default_recent_events(),
            handler_timeout_secs: default_handler_timeout_secs(),
            pattern_same_kind: default_pattern_same_kind(),
            pattern_window_count: default_pattern_window_count(),
            pattern_window_secs: default_pattern_window_secs(),
            short_retry_delay_ms: default_short_retry_delay_ms(),
            cooldown_secs: default_cooldown_secs(),
            systemic_cooldown_secs: default_systemic_cooldown_secs(),
            kinds: BTreeMap::new(),
        }
    }
}

impl RecoveryConfig {
    /// Backoff curve applied between unsuccessful attempts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            backoff_factor: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }

    /// Attempt budget and strategy for `kind`, after overrides.
    ///
    /// Manual-only kinds get zero automatic attempts and memory pressure gets
    /// two, unless a `[recovery.kinds.<kind>]` section says otherwise.
    pub fn kind_policy(&self, kind: ErrorKind) -> KindPolicy {
        let default_attempts = if kind.is_manual_only() {
            0
        } else if kind == ErrorKind::MemoryPressure {
            self.max_attempts.min(2)
        } else {
            self.max_attempts
        };

        let overrides = self.kinds.get(kind.as_str());
        KindPolicy {
            max_attempts: overrides
                .and_then(|o| o.max_attempts)
                .unwrap_or(default_attempts),
            strategy: overrides
                .and_then(|o| o.strategy)
                .unwrap_or_else(|| kind.default_strategy()),
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn pattern_window(&self) -> Duration {
        Duration::from_secs(self.pattern_window_secs)
    }

    pub fn short_retry_delay(&self) -> Duration {
        Duration::from_millis(self.short_retry_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn systemic_cooldown(&self) -> Duration {
        Duration::from_secs(self.systemic_cooldown_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.retry_policy().validate().map_err(|e| e.to_string())?;

        if self.history_capacity == 0 {
            return Err("recovery.history_capacity must be at least 1".to_string());
        }
        if self.handler_timeout_secs == 0 {
            return Err("recovery.handler_timeout_secs must be greater than 0".to_string());
        }
        if self.pattern_same_kind == 0 || self.pattern_window_count == 0 {
            return Err("recovery pattern thresholds must be at least 1".to_string());
        }
        if self.pattern_window_secs == 0 {
            return Err("recovery.pattern_window_secs must be greater than 0".to_string());
        }
        if self.cooldown_secs >= self.handler_timeout_secs {
            return Err("recovery.cooldown_secs must be below recovery.handler_timeout_secs".to_string());
        }
        for name in self.kinds.keys() {
            name.parse::<ErrorKind>()
                .map_err(|e| format!("recovery.kinds: {}", e))?;
        }
        Ok(())
    }
}

/// Circuit breaker defaults shared by every named breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

/// Intervention queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterventionConfig {
    /// Timeout for requests filed without a kind-specific timeout
    pub default_timeout_minutes: u64,

    /// How often the background sweeper expires overdue requests
    pub sweep_interval_secs: u64,

    /// Terminal requests retained for listing
    pub history_capacity: usize,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 60,
            sweep_interval_secs: 30,
            history_capacity: 500,
        }
    }
}

impl InterventionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_timeout_minutes == 0 {
            return Err("interventions.default_timeout_minutes must be greater than 0".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("interventions.sweep_interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// One webhook channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
}

/// Notification fanout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Broadcast records retained for audit
    pub history_capacity: usize,

    /// Deadline for a single channel delivery
    pub send_timeout_secs: u64,

    /// Emit every notification through `tracing`
    pub log_channel: bool,

    /// Append notifications as JSON lines to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,

    pub webhooks: Vec<WebhookConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            send_timeout_secs: 10,
            log_channel: true,
            file_path: None,
            webhooks: Vec::new(),
        }
    }
}

impl NotificationConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.history_capacity == 0 {
            return Err("notifications.history_capacity must be at least 1".to_string());
        }
        if self.send_timeout_secs == 0 {
            return Err("notifications.send_timeout_secs must be greater than 0".to_string());
        }
        for hook in &self.webhooks {
            if !(hook.url.starts_with("http://") || hook.url.starts_with("https://")) {
                return Err(format!(
                    "notifications.webhooks: '{}' has a non-http url",
                    hook.name
                ));
            }
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Shell commands backing the named remediation capabilities.
///
/// Keys are capability names (`restart_link_server`, `reconnect_device`,
/// `restart_worker`, `release_memory_pressure`, `restart_network_stack`).
/// `{device_id}` and `{worker_id}` are substituted before running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    pub commands: BTreeMap<String, String>,
    pub command_timeout_secs: u64,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            command_timeout_secs: 60,
        }
    }
}

impl CapabilitiesConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_is_default() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config = WardenConfig::from_toml(
            r#"
            [recovery]
            max_attempts = 5

            [recovery.kinds.rate-limited]
            max_attempts = 8

            [watchdog]
            check_interval_s = 10

            [[notifications.webhooks]]
            name = "ops"
            url = "https://hooks.example.com/warden"
            "#,
        )
        .unwrap();

        assert_eq!(config.recovery.max_attempts, 5);
        assert_eq!(config.recovery.initial_retry_delay_ms, 1_000);
        assert_eq!(config.watchdog.check_interval_s, 10);
        assert_eq!(config.watchdog.max_restart_attempts, 5);
        assert_eq!(config.notifications.webhooks.len(), 1);
        assert!(config.notifications.log_channel);

        assert_eq!(
            config.recovery.kind_policy(ErrorKind::RateLimited).max_attempts,
            8
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kind_policy_defaults() {
        let recovery = RecoveryConfig::default();

        let captcha = recovery.kind_policy(ErrorKind::CaptchaChallenge);
        assert_eq!(captcha.max_attempts, 0);
        assert_eq!(captcha.strategy, RecoveryStrategy::ManualIntervention);

        assert_eq!(recovery.kind_policy(ErrorKind::MemoryPressure).max_attempts, 2);
        assert_eq!(recovery.kind_policy(ErrorKind::DeviceOffline).max_attempts, 3);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = WardenConfig::default();
        config.recovery.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.recovery.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.recovery.initial_retry_delay_ms = 120_000;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.recovery.cooldown_secs = config.recovery.handler_timeout_secs;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.interventions.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config
            .recovery
            .kinds
            .insert("disk-on-fire".to_string(), KindOverride::default());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warden.toml");

        let mut config = WardenConfig::default();
        config.recovery.max_attempts = 4;
        config.notifications.file_path = Some(dir.path().join("notifications.jsonl"));
        config
            .capabilities
            .commands
            .insert("restart_worker".to_string(), "systemctl restart worker@{worker_id}".to_string());

        config.to_file(&path).unwrap();
        let loaded = WardenConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let err = WardenConfig::from_file(Path::new("/nonexistent/warden.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
