/*!
 * Remediation capabilities exposed by automation collaborators
 *
 * The recovery engine never talks to devices, browsers or VPN clients
 * directly. It invokes the named capabilities below and only consumes
 * success or failure.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::CapabilitiesConfig;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability '{0}' is not configured")]
    NotConfigured(Capability),

    #[error("failed to launch '{capability}': {source}")]
    Spawn {
        capability: Capability,
        source: std::io::Error,
    },

    #[error("'{capability}' exited with {status}: {stderr}")]
    CommandFailed {
        capability: Capability,
        status: String,
        stderr: String,
    },

    #[error("'{capability}' timed out after {after:?}")]
    Timeout {
        capability: Capability,
        after: Duration,
    },

    #[error("'{capability}' failed: {message}")]
    Failed {
        capability: Capability,
        message: String,
    },
}

/// Named egress capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RestartLinkServer,
    ReconnectDevice,
    RestartWorker,
    ReleaseMemoryPressure,
    RestartNetworkStack,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::RestartLinkServer,
        Capability::ReconnectDevice,
        Capability::RestartWorker,
        Capability::ReleaseMemoryPressure,
        Capability::RestartNetworkStack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::RestartLinkServer => "restart_link_server",
            Capability::ReconnectDevice => "reconnect_device",
            Capability::RestartWorker => "restart_worker",
            Capability::ReleaseMemoryPressure => "release_memory_pressure",
            Capability::RestartNetworkStack => "restart_network_stack",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation actions the coordinator and watchdog may invoke
#[async_trait]
pub trait Remediation: Send + Sync {
    async fn restart_link_server(&self) -> Result<(), CapabilityError>;

    async fn reconnect_device(&self, device_id: &str) -> Result<(), CapabilityError>;

    async fn restart_worker(&self, worker_id: &str) -> Result<(), CapabilityError>;

    async fn release_memory_pressure(&self) -> Result<(), CapabilityError>;

    async fn restart_network_stack(&self) -> Result<(), CapabilityError>;
}

/// Runs an operator-supplied shell command per capability.
///
/// `{device_id}` and `{worker_id}` in a command are replaced with the
/// corresponding argument. Capabilities without a command fail with
/// [`CapabilityError::NotConfigured`].
#[derive(Debug, Clone)]
pub struct CommandRemediation {
    commands: BTreeMap<Capability, String>,
    timeout: Duration,
}

impl CommandRemediation {
    pub fn new(config: &CapabilitiesConfig) -> Self {
        let mut commands = BTreeMap::new();
        for capability in Capability::ALL {
            if let Some(cmd) = config.commands.get(capability.as_str()) {
                commands.insert(capability, cmd.clone());
            }
        }
        for name in config.commands.keys() {
            if !Capability::ALL.iter().any(|c| c.as_str() == name) {
                warn!(capability = %name, "ignoring command for unknown capability");
            }
        }

        Self {
            commands,
            timeout: config.command_timeout(),
        }
    }

    pub fn is_configured(&self, capability: Capability) -> bool {
        self.commands.contains_key(&capability)
    }

    async fn run(&self, capability: Capability, vars: &[(&str, &str)]) -> Result<(), CapabilityError> {
        let template = self
            .commands
            .get(&capability)
            .ok_or(CapabilityError::NotConfigured(capability))?;

        let command_line = vars.iter().fold(template.clone(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        });
        debug!(%capability, command = %command_line, "running remediation command");

        let mut command = shell(&command_line);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|source| CapabilityError::Spawn { capability, source })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CapabilityError::Timeout {
                capability,
                after: self.timeout,
            })?
            .map_err(|source| CapabilityError::Spawn { capability, source })?;

        if output.status.success() {
            info!(%capability, "✅ remediation succeeded");
            Ok(())
        } else {
            Err(CapabilityError::CommandFailed {
                capability,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(windows)]
pub(crate) fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

#[cfg(not(windows))]
pub(crate) fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[async_trait]
impl Remediation for CommandRemediation {
    async fn restart_link_server(&self) -> Result<(), CapabilityError> {
        self.run(Capability::RestartLinkServer, &[]).await
    }

    async fn reconnect_device(&self, device_id: &str) -> Result<(), CapabilityError> {
        self.run(Capability::ReconnectDevice, &[("device_id", device_id)])
            .await
    }

    async fn restart_worker(&self, worker_id: &str) -> Result<(), CapabilityError> {
        self.run(Capability::RestartWorker, &[("worker_id", worker_id)])
            .await
    }

    async fn release_memory_pressure(&self) -> Result<(), CapabilityError> {
        self.run(Capability::ReleaseMemoryPressure, &[]).await
    }

    async fn restart_network_stack(&self) -> Result<(), CapabilityError> {
        self.run(Capability::RestartNetworkStack, &[]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn remediation(commands: &[(&str, &str)], timeout_secs: u64) -> CommandRemediation {
        CommandRemediation::new(&CapabilitiesConfig {
            commands: commands
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            command_timeout_secs: timeout_secs,
        })
    }

    #[tokio::test]
    async fn test_unconfigured_capability() {
        let r = remediation(&[], 5);
        assert!(matches!(
            r.restart_link_server().await,
            Err(CapabilityError::NotConfigured(Capability::RestartLinkServer))
        ));
    }

    #[tokio::test]
    async fn test_successful_command_with_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reconnected");
        let cmd = format!("echo {{device_id}} > {}", marker.display());
        let r = remediation(&[("reconnect_device", cmd.as_str())], 5);

        r.reconnect_device("emulator-5554").await.unwrap();
        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "emulator-5554");
    }

    #[tokio::test]
    async fn test_failing_command() {
        let r = remediation(&[("restart_worker", "echo nope >&2; exit 3")], 5);
        match r.restart_worker("w1").await {
            Err(CapabilityError::CommandFailed { stderr, .. }) => assert_eq!(stderr, "nope"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let r = remediation(&[("restart_network_stack", "sleep 5")], 1);
        assert!(matches!(
            r.restart_network_stack().await,
            Err(CapabilityError::Timeout { .. })
        ));
    }

    #[test]
    fn test_unknown_capability_ignored() {
        let r = remediation(&[("reboot_universe", "true"), ("restart_link_server", "true")], 5);
        assert!(r.is_configured(Capability::RestartLinkServer));
        assert!(!r.is_configured(Capability::RestartWorker));
    }
}
