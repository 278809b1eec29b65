//! Built-in notification channels

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{Notification, NotificationChannel, NotificationKind, NotifyError};
use crate::audit::{AuditRecord, AuditWriter};

/// Emits notifications through `tracing`
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        let intervention = n
            .intervention
            .as_ref()
            .map(|i| i.intervention_id.as_str())
            .unwrap_or("-");

        match n.kind {
            NotificationKind::SystemEmergencyStop | NotificationKind::InterventionTimeout => {
                error!(kind = %n.kind, intervention, "🚨 {}: {}", n.title, n.message)
            }
            kind if kind.is_alert() => {
                warn!(kind = %n.kind, intervention, "📣 {}: {}", n.title, n.message)
            }
            _ => info!(kind = %n.kind, intervention, "📣 {}: {}", n.title, n.message),
        }
        Ok(())
    }
}

/// Appends notifications to a JSON Lines file
#[derive(Debug, Clone)]
pub struct FileChannel {
    name: String,
    writer: AuditWriter,
}

impl FileChannel {
    pub fn open(name: impl Into<String>, path: &Path) -> Result<Self, NotifyError> {
        Ok(Self {
            name: name.into(),
            writer: AuditWriter::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}

#[async_trait]
impl NotificationChannel for FileChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.writer.append(&notification.to_audit_record())?;
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    /// Chat-style summary line (Slack and compatible receivers display it)
    text: String,
    #[serde(flatten)]
    record: &'a AuditRecord,
}

/// POSTs notifications as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let record = notification.to_audit_record();
        let payload = WebhookPayload {
            text: format!("[{}] {}: {}", notification.kind, notification.title, notification.message),
            record: &record,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}
