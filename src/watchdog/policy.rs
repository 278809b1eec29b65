//! Watchdog Policy
//!
//! Defines the intervals, restart bounds and resource thresholds for the
//! watchdog loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capabilities::Capability;
use crate::model::ErrorKind;

/// Component declared in configuration: a shell health check plus an
/// optional restart capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,

    /// Kind used when the component is reported or escalated
    pub kind: ErrorKind,

    /// Healthy when the command exits 0
    pub check_command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<Capability>,

    /// Device or worker id passed to the restart capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default)]
    pub report_sustained: bool,
}

/// Watchdog operational policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogPolicy {
    /// Seconds between health-check cycles
    ///
    /// **Default:** 30
    pub check_interval_s: u64,

    /// Automatic restarts allowed per component before an operator is asked
    ///
    /// Reaching this bound files exactly one intervention and stops
    /// auto-restarting the component until that intervention completes.
    ///
    /// **Default:** 5
    pub max_restart_attempts: u32,

    /// Pause before the supervisor restarts a cycle that panicked or failed
    ///
    /// **Default:** 5
    pub loop_restart_delay_s: u64,

    /// Consecutive unhealthy cycles before a component is also reported to
    /// the recovery coordinator
    ///
    /// **Default:** 3
    pub sustained_failure_cycles: u32,

    /// Deadline for a single health check
    ///
    /// **Default:** 10
    pub check_timeout_s: u64,

    /// Restart records retained in the history ring
    ///
    /// **Default:** 100
    pub history_capacity: usize,

    /// Restart records included in `status`
    ///
    /// **Default:** 10
    pub recent_restarts: usize,

    /// Timeout of interventions filed by the watchdog
    ///
    /// **Default:** 120 (2 hours)
    pub intervention_timeout_minutes: u64,

    /// Register the built-in system resource and disk checkers
    ///
    /// **Default:** true
    pub builtin_checkers: bool,

    /// **Default:** 90.0
    pub cpu_threshold_percent: f32,

    /// **Default:** 90.0
    pub memory_threshold_percent: f32,

    /// Disk usage reported as a warning (still healthy)
    ///
    /// **Default:** 85.0
    pub disk_warning_percent: f32,

    /// Disk usage reported as unhealthy
    ///
    /// **Default:** 95.0
    pub disk_critical_percent: f32,

    /// Components checked by shell command (`[[watchdog.components]]`)
    ///
    /// **Default:** none
    pub components: Vec<ComponentSpec>,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            check_interval_s: 30,
            max_restart_attempts: 5,
            loop_restart_delay_s: 5,
            sustained_failure_cycles: 3,
            check_timeout_s: 10,
            history_capacity: 100,
            recent_restarts: 10,
            intervention_timeout_minutes: 120,
            builtin_checkers: true,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            disk_warning_percent: 85.0,
            disk_critical_percent: 95.0,
            components: Vec::new(),
        }
    }
}

impl WatchdogPolicy {
    /// Policy with a custom check interval; other parameters use defaults
    pub fn with_interval(check_interval_s: u64) -> Self {
        Self {
            check_interval_s,
            ..Default::default()
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_s)
    }

    pub fn loop_restart_delay(&self) -> Duration {
        Duration::from_secs(self.loop_restart_delay_s)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_s)
    }

    pub fn intervention_timeout(&self) -> Duration {
        Duration::from_secs(self.intervention_timeout_minutes * 60)
    }

    /// Validate the policy configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval_s == 0 {
            return Err("watchdog.check_interval_s must be greater than 0".to_string());
        }

        if self.max_restart_attempts == 0 {
            return Err("watchdog.max_restart_attempts must be at least 1".to_string());
        }

        if self.sustained_failure_cycles == 0 {
            return Err("watchdog.sustained_failure_cycles must be at least 1".to_string());
        }

        if self.check_timeout_s == 0 {
            return Err("watchdog.check_timeout_s must be greater than 0".to_string());
        }

        if self.history_capacity == 0 {
            return Err("watchdog.history_capacity must be at least 1".to_string());
        }

        if self.intervention_timeout_minutes == 0 {
            return Err("watchdog.intervention_timeout_minutes must be greater than 0".to_string());
        }

        for (name, value) in [
            ("cpu_threshold_percent", self.cpu_threshold_percent),
            ("memory_threshold_percent", self.memory_threshold_percent),
            ("disk_warning_percent", self.disk_warning_percent),
            ("disk_critical_percent", self.disk_critical_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(format!("watchdog.{} must be within 0-100", name));
            }
        }

        if self.disk_warning_percent > self.disk_critical_percent {
            return Err("watchdog.disk_warning_percent must not exceed disk_critical_percent".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() || component.check_command.trim().is_empty() {
                return Err("watchdog.components need a name and a check_command".to_string());
            }
            if !names.insert(component.name.as_str()) {
                return Err(format!("watchdog.components: duplicate name '{}'", component.name));
            }
        }

        Ok(())
    }
}
