//! Built-in health checkers: shell commands and `sysinfo` resource probes

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use sysinfo::{Disks, System};

use super::{CheckResult, HealthChecker};
use crate::capabilities::shell;
use crate::model::HealthStatus;

/// Healthy when a shell command exits 0
pub struct CommandChecker {
    component: String,
    command: String,
}

impl CommandChecker {
    pub fn new(component: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl HealthChecker for CommandChecker {
    async fn check(&self) -> CheckResult {
        let output = shell(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let summary = stdout.lines().next().unwrap_or("ok").trim().to_string();
            Ok(HealthStatus::healthy(&self.component, summary))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(HealthStatus::unhealthy(
                &self.component,
                format!("check exited with {}: {}", output.status, stderr.trim()),
            ))
        }
    }
}

/// CPU and memory usage against fixed thresholds.
///
/// CPU usage is measured between consecutive checks, so the first check
/// after construction reports 0% CPU.
pub struct SystemResourceChecker {
    component: String,
    cpu_threshold: f32,
    memory_threshold: f32,
    system: Mutex<System>,
}

impl SystemResourceChecker {
    pub fn new(component: impl Into<String>, cpu_threshold: f32, memory_threshold: f32) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            component: component.into(),
            cpu_threshold,
            memory_threshold,
            system: Mutex::new(system),
        }
    }

    fn sample(&self) -> (f32, f32, u64) {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu = system.global_cpu_usage();
        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        (cpu, memory, system.available_memory())
    }
}

#[async_trait]
impl HealthChecker for SystemResourceChecker {
    async fn check(&self) -> CheckResult {
        let (cpu, memory, available) = self.sample();

        let mut problems = Vec::new();
        if cpu > self.cpu_threshold {
            problems.push(format!("cpu {:.1}% above {:.0}%", cpu, self.cpu_threshold));
        }
        if memory > self.memory_threshold {
            problems.push(format!("memory {:.1}% above {:.0}%", memory, self.memory_threshold));
        }

        let status = if problems.is_empty() {
            HealthStatus::healthy(
                &self.component,
                format!("cpu {:.1}%, memory {:.1}%", cpu, memory),
            )
        } else {
            HealthStatus::unhealthy(&self.component, problems.join("; "))
        };

        Ok(status
            .with_metric("cpu_percent", cpu as f64)
            .with_metric("memory_percent", memory as f64)
            .with_metric("available_memory_mb", (available / 1024 / 1024) as f64))
    }
}

/// Usage of the fullest mounted disk
pub struct DiskSpaceChecker {
    component: String,
    warning_percent: f32,
    critical_percent: f32,
}

impl DiskSpaceChecker {
    pub fn new(component: impl Into<String>, warning_percent: f32, critical_percent: f32) -> Self {
        Self {
            component: component.into(),
            warning_percent,
            critical_percent,
        }
    }

    /// Classify a usage figure; `mount` names the disk in the message
    pub fn evaluate(&self, mount: &str, used_percent: f32) -> HealthStatus {
        let status = if used_percent >= self.critical_percent {
            HealthStatus::unhealthy(
                &self.component,
                format!("{} is {:.1}% full (critical at {:.0}%)", mount, used_percent, self.critical_percent),
            )
        } else if used_percent >= self.warning_percent {
            HealthStatus::healthy(
                &self.component,
                format!("{} is {:.1}% full (warning at {:.0}%)", mount, used_percent, self.warning_percent),
            )
        } else {
            HealthStatus::healthy(&self.component, format!("{} is {:.1}% full", mount, used_percent))
        };
        status.with_metric("disk_used_percent", used_percent as f64)
    }
}

#[async_trait]
impl HealthChecker for DiskSpaceChecker {
    async fn check(&self) -> CheckResult {
        let disks = Disks::new_with_refreshed_list();

        let fullest = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space().saturating_sub(d.available_space());
                let percent = (used as f64 / d.total_space() as f64 * 100.0) as f32;
                (d.mount_point().display().to_string(), percent)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match fullest {
            Some((mount, percent)) => Ok(self.evaluate(&mount, percent)),
            None => Ok(HealthStatus::healthy(&self.component, "no disks reported")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_checker_exit_status() {
        let ok = CommandChecker::new("link", "echo 3 devices attached").check().await.unwrap();
        assert!(ok.healthy);
        assert_eq!(ok.message, "3 devices attached");

        let bad = CommandChecker::new("link", "echo refused >&2; exit 1").check().await.unwrap();
        assert!(!bad.healthy);
        assert!(bad.message.contains("refused"));
    }

    #[test]
    fn test_disk_thresholds() {
        let checker = DiskSpaceChecker::new("disk", 85.0, 95.0);

        assert!(checker.evaluate("/", 40.0).healthy);

        let warning = checker.evaluate("/", 90.0);
        assert!(warning.healthy);
        assert!(warning.message.contains("warning"));

        let critical = checker.evaluate("/data", 97.5);
        assert!(!critical.healthy);
        assert!(critical.message.contains("/data"));
        assert_eq!(critical.metrics.get("disk_used_percent"), Some(&97.5));
    }

    #[tokio::test]
    async fn test_resource_checker_reports_metrics() {
        let checker = SystemResourceChecker::new("system", 100.0, 100.0);
        let status = checker.check().await.unwrap();

        assert!(status.healthy);
        assert!(status.metrics.contains_key("cpu_percent"));
        assert!(status.metrics.contains_key("memory_percent"));
    }

    #[tokio::test]
    async fn test_resource_checker_flags_low_threshold() {
        // memory usage is never negative, so a negative threshold always trips
        let checker = SystemResourceChecker::new("system", 100.0, -1.0);
        let status = checker.check().await.unwrap();

        assert!(!status.healthy);
        assert!(status.message.contains("memory"));
    }
}
