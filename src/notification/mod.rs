/*!
 * Notification Fanout
 *
 * Broadcasts intervention and system events to every registered channel.
 * Channels are sent to concurrently and independently: a channel that errors,
 * times out or panics is recorded as failed and never blocks delivery to the
 * others. The last N broadcasts are retained for audit and tests.
 */

mod channels;

pub use channels::{FileChannel, LogChannel, WebhookChannel};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditError, AuditRecord};
use crate::config::NotificationConfig;
use crate::intervention::InterventionSnapshot;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned HTTP {0}")]
    HttpStatus(u16),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    InterventionRequested,
    InterventionAssigned,
    InterventionStarted,
    InterventionCompleted,
    InterventionFailed,
    InterventionEscalated,
    InterventionTimeout,
    InterventionCancelled,
    SystemPaused,
    SystemResumed,
    SystemEmergencyStop,
    ComponentRestarted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::InterventionRequested => "intervention-requested",
            NotificationKind::InterventionAssigned => "intervention-assigned",
            NotificationKind::InterventionStarted => "intervention-started",
            NotificationKind::InterventionCompleted => "intervention-completed",
            NotificationKind::InterventionFailed => "intervention-failed",
            NotificationKind::InterventionEscalated => "intervention-escalated",
            NotificationKind::InterventionTimeout => "intervention-timeout",
            NotificationKind::InterventionCancelled => "intervention-cancelled",
            NotificationKind::SystemPaused => "system-paused",
            NotificationKind::SystemResumed => "system-resumed",
            NotificationKind::SystemEmergencyStop => "system-emergency-stop",
            NotificationKind::ComponentRestarted => "component-restarted",
        }
    }

    /// Kinds that signal degradation rather than progress
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            NotificationKind::InterventionRequested
                | NotificationKind::InterventionFailed
                | NotificationKind::InterventionEscalated
                | NotificationKind::InterventionTimeout
                | NotificationKind::SystemPaused
                | NotificationKind::SystemEmergencyStop
        )
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event to broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention: Option<InterventionSnapshot>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            title: title.into(),
            message: message.into(),
            intervention: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_intervention(mut self, snapshot: InterventionSnapshot) -> Self {
        self.intervention = Some(snapshot);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Flattened form written to the audit trail and posted to webhooks
    pub fn to_audit_record(&self) -> AuditRecord {
        AuditRecord {
            ts: self.timestamp,
            event: self.kind.as_str().to_string(),
            title: self.title.clone(),
            message: self.message.clone(),
            intervention: self.intervention.clone(),
            data: self.data.clone(),
        }
    }
}

/// A pluggable sink for notifications
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Name used in delivery records
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryOutcome {
    /// Every channel accepted the notification
    Delivered,
    /// Some channels failed, at least one succeeded
    Partial,
    /// Every channel failed
    Failed,
    NoChannels,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFailure {
    pub channel: String,
    pub error: String,
}

/// Audit entry for one broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: NotificationKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention_id: Option<String>,
    pub delivered: Vec<String>,
    pub failed: Vec<ChannelFailure>,
    pub outcome: DeliveryOutcome,
}

/// Broadcasts notifications to every registered channel
pub struct NotificationFanout {
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    history: Mutex<VecDeque<BroadcastRecord>>,
    history_capacity: usize,
    send_timeout: Duration,
}

impl NotificationFanout {
    /// Fanout without channels; register them with [`register`](Self::register)
    pub fn new(config: &NotificationConfig) -> Self {
        Self::with_settings(config.history_capacity, config.send_timeout())
    }

    pub fn with_settings(history_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity.min(1024))),
            history_capacity: history_capacity.max(1),
            send_timeout,
        }
    }

    /// Fanout with the channels named in `config`
    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotifyError> {
        let fanout = Self::new(config);

        if config.log_channel {
            fanout.register(Arc::new(LogChannel::new("log")));
        }
        if let Some(path) = &config.file_path {
            fanout.register(Arc::new(FileChannel::open("file", path)?));
        }
        for hook in &config.webhooks {
            fanout.register(Arc::new(WebhookChannel::new(
                hook.name.clone(),
                hook.url.clone(),
                config.send_timeout(),
            )?));
        }

        Ok(fanout)
    }

    pub fn register(&self, channel: Arc<dyn NotificationChannel>) {
        debug!(channel = channel.name(), "notification channel registered");
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Send `notification` to every channel and record the result
    pub async fn broadcast(&self, notification: Notification) -> BroadcastRecord {
        let channels: Vec<_> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let deliveries = channels.iter().map(|channel| {
            let notification = &notification;
            async move {
                let send = AssertUnwindSafe(channel.send(notification)).catch_unwind();
                let result = match tokio::time::timeout(self.send_timeout, send).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(NotifyError::Panicked(crate::error::panic_message(panic.as_ref()))),
                    Err(_) => Err(NotifyError::Timeout(self.send_timeout)),
                };
                (channel.name().to_string(), result)
            }
        });

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in join_all(deliveries).await {
            match result {
                Ok(()) => delivered.push(name),
                Err(e) => {
                    warn!(channel = %name, kind = %notification.kind, error = %e, "notification delivery failed");
                    failed.push(ChannelFailure {
                        channel: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        let outcome = match (delivered.is_empty(), failed.is_empty()) {
            (true, true) => DeliveryOutcome::NoChannels,
            (false, true) => DeliveryOutcome::Delivered,
            (false, false) => DeliveryOutcome::Partial,
            (true, false) => DeliveryOutcome::Failed,
        };

        let record = BroadcastRecord {
            timestamp: notification.timestamp,
            kind: notification.kind,
            title: notification.title,
            intervention_id: notification.intervention.map(|i| i.intervention_id),
            delivered,
            failed,
            outcome,
        };

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(record.clone());
        while history.len() > self.history_capacity {
            history.pop_front();
        }

        record
    }

    /// Retained broadcast records, oldest first
    pub fn history(&self) -> Vec<BroadcastRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingChannel {
        name: String,
        sent: AtomicU32,
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenChannel;

    #[async_trait]
    impl NotificationChannel for BrokenChannel {
        fn name(&self) -> &str {
            "broken"
        }

        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Other("smtp server unreachable".to_string()))
        }
    }

    struct PanickingChannel;

    #[async_trait]
    impl NotificationChannel for PanickingChannel {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            panic!("formatter bug");
        }
    }

    struct StuckChannel;

    #[async_trait]
    impl NotificationChannel for StuckChannel {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn counting(name: &str) -> Arc<CountingChannel> {
        Arc::new(CountingChannel {
            name: name.to_string(),
            sent: AtomicU32::new(0),
        })
    }

    fn paused() -> Notification {
        Notification::new(NotificationKind::SystemPaused, "System paused", "memory pressure")
    }

    #[tokio::test]
    async fn test_partial_delivery() {
        let fanout = NotificationFanout::with_settings(10, Duration::from_secs(5));
        let good = counting("good");
        fanout.register(good.clone());
        fanout.register(Arc::new(BrokenChannel));

        let record = fanout.broadcast(paused()).await;

        assert_eq!(record.outcome, DeliveryOutcome::Partial);
        assert_eq!(record.delivered, vec!["good".to_string()]);
        assert_eq!(record.failed.len(), 1);
        assert_eq!(record.failed[0].channel, "broken");
        assert!(record.failed[0].error.contains("smtp"));
        assert_eq!(good.sent.load(Ordering::SeqCst), 1);
        assert_eq!(fanout.history(), vec![record]);
    }

    #[tokio::test]
    async fn test_panicking_channel_is_isolated() {
        let fanout = NotificationFanout::with_settings(10, Duration::from_secs(5));
        let good = counting("good");
        fanout.register(Arc::new(PanickingChannel));
        fanout.register(good.clone());

        let record = fanout.broadcast(paused()).await;

        assert_eq!(record.outcome, DeliveryOutcome::Partial);
        assert_eq!(record.failed[0].channel, "panicking");
        assert!(record.failed[0].error.contains("formatter bug"));
        assert_eq!(good.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_channel_times_out() {
        let fanout = NotificationFanout::with_settings(10, Duration::from_secs(2));
        fanout.register(Arc::new(StuckChannel));
        fanout.register(counting("good"));

        let record = fanout.broadcast(paused()).await;

        assert_eq!(record.outcome, DeliveryOutcome::Partial);
        assert_eq!(record.failed[0].channel, "stuck");
        assert!(record.failed[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_outcomes() {
        let fanout = NotificationFanout::with_settings(10, Duration::from_secs(5));
        assert_eq!(fanout.broadcast(paused()).await.outcome, DeliveryOutcome::NoChannels);

        fanout.register(Arc::new(BrokenChannel));
        assert_eq!(fanout.broadcast(paused()).await.outcome, DeliveryOutcome::Failed);

        let fanout = NotificationFanout::with_settings(10, Duration::from_secs(5));
        fanout.register(counting("a"));
        fanout.register(counting("b"));
        let record = fanout.broadcast(paused()).await;
        assert_eq!(record.outcome, DeliveryOutcome::Delivered);
        assert_eq!(record.delivered.len(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let fanout = NotificationFanout::with_settings(3, Duration::from_secs(5));
        for i in 0..5 {
            fanout
                .broadcast(Notification::new(
                    NotificationKind::ComponentRestarted,
                    format!("restart {}", i),
                    "ok",
                ))
                .await;
        }

        let titles: Vec<_> = fanout.history().into_iter().map(|r| r.title).collect();
        assert_eq!(titles, vec!["restart 2", "restart 3", "restart 4"]);
    }

    #[test]
    fn test_from_config_registers_channels() {
        let dir = tempfile::tempdir().unwrap();
        let config = NotificationConfig {
            file_path: Some(dir.path().join("notifications.jsonl")),
            webhooks: vec![crate::config::WebhookConfig {
                name: "ops".to_string(),
                url: "https://hooks.example.com/warden".to_string(),
            }],
            ..Default::default()
        };

        let fanout = NotificationFanout::from_config(&config).unwrap();
        assert_eq!(fanout.channel_names(), vec!["log", "file", "ops"]);
    }
}
