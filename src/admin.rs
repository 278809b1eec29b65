/*!
 * Administrative command surface
 *
 * A command is a name plus positional arguments; every command answers with
 * an [`AdminResponse`] that serializes to `{success, command, result|error}`.
 * `status` works in every system state, including after an emergency stop.
 */

use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info};

use crate::coordinator::{RecoveryCoordinator, RecoveryError};
use crate::intervention::{InterventionError, InterventionRequest, ListFilter};
use crate::model::Priority;
use crate::watchdog::Watchdog;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid {what} '{value}'")]
    InvalidArgument { what: &'static str, value: String },

    #[error("unterminated quote in command line")]
    UnterminatedQuote,

    #[error(transparent)]
    Intervention(#[from] InterventionError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

/// Command names with their usage, in `help` order
pub const COMMANDS: &[(&str, &str)] = &[
    ("status", "status - system, intervention and watchdog status"),
    ("list_interventions", "list_interventions [pending|active] - list intervention requests"),
    ("assign", "assign <intervention_id> <assignee> - assign a pending request"),
    ("claim", "claim <assignee> - assign the highest-priority pending request"),
    ("start", "start <intervention_id> - mark an assigned request in progress"),
    ("complete", "complete <intervention_id> <resolution> [success] [notes] - finish a request"),
    ("escalate", "escalate <intervention_id> <priority> - change a request's priority"),
    ("cancel", "cancel <intervention_id> [reason] - cancel a request"),
    ("system_pause", "system_pause [reason] - pause automatic recovery"),
    ("system_resume", "system_resume - resume automatic recovery"),
    ("system_emergency_stop", "system_emergency_stop [reason] - stop everything"),
    ("help", "help - show this help"),
];

/// Structured result of one command
#[derive(Debug, Clone, Serialize)]
pub struct AdminResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_commands: Option<Vec<&'static str>>,
}

impl AdminResponse {
    fn ok(command: &str, result: Value) -> Self {
        Self {
            success: true,
            command: Some(command.to_string()),
            result: Some(result),
            error: None,
            available_commands: None,
        }
    }

    fn failed(command: &str, err: &AdminError) -> Self {
        let available_commands = matches!(err, AdminError::UnknownCommand(_))
            .then(|| COMMANDS.iter().map(|(name, _)| *name).collect());
        Self {
            success: false,
            command: Some(command.to_string()),
            result: None,
            error: Some(err.to_string()),
            available_commands,
        }
    }
}

/// Split a command line into words. Double quotes group words and a
/// backslash escapes the next character.
pub fn tokenize(line: &str) -> Result<Vec<String>, AdminError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quoted {
        return Err(AdminError::UnterminatedQuote);
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Operator commands over a running engine
#[derive(Clone)]
pub struct AdminInterface {
    coordinator: RecoveryCoordinator,
    watchdog: Option<Watchdog>,
}

impl AdminInterface {
    pub fn new(coordinator: RecoveryCoordinator) -> Self {
        Self {
            coordinator,
            watchdog: None,
        }
    }

    /// Include watchdog status in `status`
    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Tokenize and run one line. Blank lines yield `None`.
    pub async fn execute_line(&self, line: &str) -> Option<AdminResponse> {
        match tokenize(line) {
            Ok(words) => {
                let (command, args) = words.split_first()?;
                Some(self.execute(command, args).await)
            }
            Err(e) => Some(AdminResponse::failed("", &e)),
        }
    }

    /// Run `command` with positional `args`
    pub async fn execute<S: AsRef<str>>(&self, command: &str, args: &[S]) -> AdminResponse {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        match self.dispatch(command, &args).await {
            Ok(result) => AdminResponse::ok(command, result),
            Err(e) => {
                error!(command, error = %e, "admin command failed");
                AdminResponse::failed(command, &e)
            }
        }
    }

    async fn dispatch(&self, command: &str, args: &[&str]) -> Result<Value, AdminError> {
        match command {
            "status" => Ok(self.status()),
            "list_interventions" => self.list_interventions(args).await,
            "assign" => self.assign(args).await,
            "claim" => self.claim(args).await,
            "start" => self.start(args).await,
            "complete" => self.complete(args).await,
            "escalate" => self.escalate(args).await,
            "cancel" => self.cancel(args).await,
            "system_pause" => self.system_pause(args).await,
            "system_resume" => self.system_resume().await,
            "system_emergency_stop" => self.system_emergency_stop(args).await,
            "help" => Ok(help()),
            other => Err(AdminError::UnknownCommand(other.to_string())),
        }
    }

    fn status(&self) -> Value {
        json!({
            "system": self.coordinator.get_status(),
            "watchdog": self.watchdog.as_ref().map(Watchdog::status),
            "timestamp": chrono::Utc::now(),
        })
    }

    async fn list_interventions(&self, args: &[&str]) -> Result<Value, AdminError> {
        let filter = match args.first() {
            Some(raw) => ListFilter::from_str(raw).map_err(|_| AdminError::InvalidArgument {
                what: "filter",
                value: raw.to_string(),
            })?,
            None => ListFilter::All,
        };

        let interventions = self.coordinator.queue().list(filter).await;
        Ok(json!({
            "total_count": interventions.len(),
            "filter": args.first(),
            "interventions": interventions,
        }))
    }

    async fn assign(&self, args: &[&str]) -> Result<Value, AdminError> {
        let [id, assignee, ..] = args else {
            return Err(AdminError::Usage("assign <intervention_id> <assignee>"));
        };
        let request = self.coordinator.queue().assign(id, assignee).await?;
        Ok(request_summary(&request))
    }

    async fn claim(&self, args: &[&str]) -> Result<Value, AdminError> {
        let [assignee, ..] = args else {
            return Err(AdminError::Usage("claim <assignee>"));
        };
        let request = self.coordinator.queue().claim_next(assignee).await?;
        Ok(request_summary(&request))
    }

    async fn start(&self, args: &[&str]) -> Result<Value, AdminError> {
        let [id, ..] = args else {
            return Err(AdminError::Usage("start <intervention_id>"));
        };
        let request = self.coordinator.queue().start(id).await?;
        Ok(request_summary(&request))
    }

    async fn complete(&self, args: &[&str]) -> Result<Value, AdminError> {
        let [id, resolution, rest @ ..] = args else {
            return Err(AdminError::Usage(
                "complete <intervention_id> <resolution> [success] [notes]",
            ));
        };
        let success = match rest.first() {
            Some(raw) => parse_flag(raw)?,
            None => true,
        };
        let notes = rest.get(1).copied();

        let request = self
            .coordinator
            .queue()
            .complete(id, resolution, success, notes)
            .await?;
        Ok(request_summary(&request))
    }

    async fn escalate(&self, args: &[&str]) -> Result<Value, AdminError> {
        let [id, raw, ..] = args else {
            return Err(AdminError::Usage("escalate <intervention_id> <priority>"));
        };
        let priority = Priority::from_str(raw).map_err(|_| AdminError::InvalidArgument {
            what: "priority",
            value: raw.to_string(),
        })?;
        let request = self.coordinator.queue().escalate(id, priority).await?;
        Ok(request_summary(&request))
    }

    async fn cancel(&self, args: &[&str]) -> Result<Value, AdminError> {
        let [id, rest @ ..] = args else {
            return Err(AdminError::Usage("cancel <intervention_id> [reason]"));
        };
        let reason = rest.first().copied().unwrap_or("cancelled via admin interface");
        let request = self.coordinator.queue().cancel(id, reason).await?;
        Ok(request_summary(&request))
    }

    async fn system_pause(&self, args: &[&str]) -> Result<Value, AdminError> {
        let reason = args.first().copied().unwrap_or("manual pause via admin interface");
        let changed = self.coordinator.pause_system(reason).await;
        info!(reason, changed, "admin pause");
        Ok(state_change("pause", Some(reason), changed, &self.coordinator))
    }

    async fn system_resume(&self) -> Result<Value, AdminError> {
        let changed = self.coordinator.resume_system().await?;
        Ok(state_change("resume", None, changed, &self.coordinator))
    }

    async fn system_emergency_stop(&self, args: &[&str]) -> Result<Value, AdminError> {
        let reason = args.first().copied().unwrap_or("emergency stop via admin interface");
        let changed = self.coordinator.emergency_stop(reason).await;
        Ok(state_change("emergency_stop", Some(reason), changed, &self.coordinator))
    }
}

fn parse_flag(raw: &str) -> Result<bool, AdminError> {
    match raw.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(AdminError::InvalidArgument {
            what: "success flag",
            value: raw.to_string(),
        }),
    }
}

fn request_summary(request: &InterventionRequest) -> Value {
    json!({
        "intervention_id": request.id,
        "status": request.status,
        "priority": request.priority,
        "assignee": request.assignee,
        "error_id": request.error_id,
        "resolution": request.resolution,
    })
}

fn state_change(
    action: &str,
    reason: Option<&str>,
    changed: bool,
    coordinator: &RecoveryCoordinator,
) -> Value {
    json!({
        "action": action,
        "reason": reason,
        "changed": changed,
        "state": coordinator.state(),
        "timestamp": chrono::Utc::now(),
    })
}

fn help() -> Value {
    let text = COMMANDS
        .iter()
        .map(|(_, usage)| *usage)
        .collect::<Vec<_>>()
        .join("\n");
    json!({ "help": text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::model::{ErrorKind, ErrorReport, InterventionType};
    use crate::notification::NotificationFanout;
    use std::sync::Arc;
    use std::time::Duration;

    fn admin() -> AdminInterface {
        let config = WardenConfig::default();
        let fanout = Arc::new(NotificationFanout::new(&config.notifications));
        AdminInterface::new(RecoveryCoordinator::from_config(&config, fanout))
    }

    async fn file_request(admin: &AdminInterface, priority: Priority) -> String {
        admin
            .coordinator
            .escalate_directly(
                ErrorReport::new(ErrorKind::DeviceOffline, "device-pool", "device unplugged")
                    .with_device("emulator-5554"),
                InterventionType::Maintenance,
                priority,
                Duration::from_secs(3600),
            )
            .await
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize(r#"complete int-1 "replugged cable" true"#).unwrap(),
            vec!["complete", "int-1", "replugged cable", "true"]
        );
        assert_eq!(tokenize("  status  ").unwrap(), vec!["status"]);
        assert_eq!(tokenize(r#"pause "" x"#).unwrap(), vec!["pause", "", "x"]);
        assert_eq!(tokenize(r#"say \"hi\""#).unwrap(), vec!["say", "\"hi\""]);
        assert!(tokenize("").unwrap().is_empty());
        assert!(matches!(tokenize(r#"pause "oops"#), Err(AdminError::UnterminatedQuote)));
    }

    #[tokio::test]
    async fn test_unknown_command_lists_commands() {
        let response = admin().execute::<&str>("reboot", &[]).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("unknown command: reboot"));
        assert!(response.available_commands.unwrap().contains(&"status"));
    }

    #[tokio::test]
    async fn test_status_serializes() {
        let response = admin().execute::<&str>("status", &[]).await;
        assert!(response.success);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["system"]["state"], "running");
        assert!(json["result"]["watchdog"].is_null());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_intervention_lifecycle() {
        let admin = admin();
        let id = file_request(&admin, Priority::High).await;

        let listed = admin.execute("list_interventions", &["pending"]).await;
        assert_eq!(listed.result.unwrap()["total_count"], 1);

        let assigned = admin.execute("assign", &[id.as_str(), "alice"]).await;
        assert!(assigned.success);
        assert_eq!(assigned.result.unwrap()["assignee"], "alice");

        let completed = admin
            .execute("complete", &[id.as_str(), "replugged cable", "true", "port 3 was loose"])
            .await;
        assert!(completed.success, "{:?}", completed.error);
        assert_eq!(completed.result.unwrap()["status"], "completed");

        let status = admin.coordinator.get_status();
        assert!(status.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_usage_and_argument_errors() {
        let admin = admin();

        let response = admin.execute("assign", &["int-1"]).await;
        assert_eq!(response.error.as_deref(), Some("usage: assign <intervention_id> <assignee>"));

        let id = file_request(&admin, Priority::Low).await;
        let response = admin.execute("escalate", &[id.as_str(), "meh"]).await;
        assert!(response.error.unwrap().contains("invalid priority"));

        let response = admin.execute("complete", &[id.as_str(), "done"]).await;
        assert!(!response.success, "pending requests cannot be completed");

        let response = admin.execute("list_interventions", &["finished"]).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_escalate_reorders_queue() {
        let admin = admin();
        let first = file_request(&admin, Priority::Medium).await;
        let second = file_request(&admin, Priority::Medium).await;

        let response = admin.execute("escalate", &[second.as_str(), "critical"]).await;
        assert!(response.success);

        let claimed = admin.execute("claim", &["bob"]).await;
        assert_eq!(claimed.result.unwrap()["intervention_id"], second.as_str());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_pause_resume_and_stop() {
        let admin = admin();

        let paused = admin.execute("system_pause", &["maintenance window"]).await;
        let result = paused.result.unwrap();
        assert_eq!(result["changed"], true);
        assert_eq!(result["state"], "paused");

        let resumed = admin.execute::<&str>("system_resume", &[]).await;
        assert_eq!(resumed.result.unwrap()["state"], "running");

        let stopped = admin.execute::<&str>("system_emergency_stop", &[]).await;
        assert!(stopped.success);
        assert!(admin.coordinator.cancellation_token().is_cancelled());

        let resumed = admin.execute::<&str>("system_resume", &[]).await;
        assert!(!resumed.success);

        // status stays available after an emergency stop
        let status = admin.execute::<&str>("status", &[]).await;
        assert_eq!(status.result.unwrap()["system"]["state"], "emergency-stop");
    }

    #[tokio::test]
    async fn test_execute_line() {
        let admin = admin();
        assert!(admin.execute_line("   ").await.is_none());

        let response = admin.execute_line(r#"system_pause "operator lunch""#).await.unwrap();
        assert_eq!(response.result.unwrap()["reason"], "operator lunch");

        let response = admin.execute_line(r#"help "#).await.unwrap();
        assert!(response.result.unwrap()["help"].as_str().unwrap().contains("system_resume"));
    }
}
