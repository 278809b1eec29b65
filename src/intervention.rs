/*!
 * Intervention Queue: human escalation requests
 *
 * Requests move through
 *
 * ```text
 * pending ──assign──> assigned ──start──> in-progress
 *    │                   │                    │
 *    │                   └──────complete──────┴──> completed | failed
 *    └─── cancel / timeout sweep (any non-terminal state) ──> cancelled | timeout
 * ```
 *
 * Every mutation runs under the queue lock, so a request has exactly one
 * owner for the duration of an operation. Notifications are sent after the
 * lock is released.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::InterventionConfig;
use crate::coordinator::ErrorLedger;
use crate::model::{ErrorEvent, ErrorKind, InterventionType, ParseEnumError, Priority};
use crate::notification::{Notification, NotificationFanout, NotificationKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterventionError {
    #[error("intervention '{0}' not found")]
    NotFound(String),

    #[error("cannot {action} intervention '{id}' while it is {from}")]
    InvalidTransition {
        id: String,
        from: InterventionStatus,
        action: &'static str,
    },

    #[error("no pending interventions")]
    EmptyQueue,
}

/// Lifecycle state of a request; terminal states are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterventionStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionStatus::Pending => "pending",
            InterventionStatus::Assigned => "assigned",
            InterventionStatus::InProgress => "in-progress",
            InterventionStatus::Completed => "completed",
            InterventionStatus::Failed => "failed",
            InterventionStatus::Timeout => "timeout",
            InterventionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InterventionStatus::Completed
                | InterventionStatus::Failed
                | InterventionStatus::Timeout
                | InterventionStatus::Cancelled
        )
    }

    /// Assigned or in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InterventionStatus::Assigned | InterventionStatus::InProgress
        )
    }
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request for human action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRequest {
    pub id: String,
    pub error_id: String,
    pub error_kind: ErrorKind,
    pub component: String,
    pub error_message: String,
    pub intervention_type: InterventionType,
    pub priority: Priority,
    pub status: InterventionStatus,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub escalation_count: u32,
    /// Insertion order, used for FIFO among equal priorities
    pub sequence: u64,
}

impl InterventionRequest {
    pub fn snapshot(&self) -> InterventionSnapshot {
        InterventionSnapshot {
            intervention_id: self.id.clone(),
            error_kind: self.error_kind,
            priority: self.priority,
            status: self.status,
            assignee: self.assignee.clone(),
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now >= self.timeout_at
    }

    fn queue_key(&self) -> QueueKey {
        (Reverse(self.priority), self.sequence, self.id.clone())
    }
}

/// Flattened view of a request carried by notifications and audit records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterventionSnapshot {
    pub intervention_id: String,
    pub error_kind: ErrorKind,
    pub priority: Priority,
    pub status: InterventionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

/// Filter accepted by [`InterventionQueue::list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFilter {
    #[default]
    All,
    Pending,
    Active,
}

impl FromStr for ListFilter {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" | "" => Ok(ListFilter::All),
            "pending" => Ok(ListFilter::Pending),
            "active" => Ok(ListFilter::Active),
            _ => Err(ParseEnumError {
                what: "intervention filter",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub total_requested: u64,
}

type QueueKey = (Reverse<Priority>, u64, String);

#[derive(Debug, Default)]
struct QueueState {
    requests: HashMap<String, InterventionRequest>,
    pending: BTreeSet<QueueKey>,
    /// Terminal request ids, oldest first, for retention
    finished: VecDeque<String>,
    next_sequence: u64,
    stats: QueueStats,
}

impl QueueState {
    fn get_mut(&mut self, id: &str) -> Result<&mut InterventionRequest, InterventionError> {
        self.requests
            .get_mut(id)
            .ok_or_else(|| InterventionError::NotFound(id.to_string()))
    }

    /// pending → assigned, with the request leaving the pending set
    fn assign(&mut self, id: &str, assignee: &str) -> Result<InterventionRequest, InterventionError> {
        let request = self.get_mut(id)?;
        if request.status != InterventionStatus::Pending {
            return Err(InterventionError::InvalidTransition {
                id: id.to_string(),
                from: request.status,
                action: "assign",
            });
        }

        let key = request.queue_key();
        request.status = InterventionStatus::Assigned;
        request.assignee = Some(assignee.to_string());
        request.assigned_at = Some(Utc::now());
        let assigned = request.clone();
        self.pending.remove(&key);
        Ok(assigned)
    }

    /// Move a request into a terminal state and update bookkeeping
    fn finish(
        &mut self,
        id: &str,
        status: InterventionStatus,
        capacity: usize,
    ) -> Result<InterventionRequest, InterventionError> {
        let request = self.get_mut(id)?;
        let key = request.queue_key();
        request.status = status;
        request.completed_at = Some(Utc::now());
        let finished = request.clone();

        self.pending.remove(&key);
        match status {
            InterventionStatus::Completed => self.stats.completed += 1,
            InterventionStatus::Failed => self.stats.failed += 1,
            InterventionStatus::Timeout => self.stats.timed_out += 1,
            InterventionStatus::Cancelled => self.stats.cancelled += 1,
            _ => {}
        }

        self.finished.push_back(finished.id.clone());
        while self.finished.len() > capacity {
            if let Some(old) = self.finished.pop_front() {
                self.requests.remove(&old);
            }
        }

        Ok(finished)
    }
}

/// Priority queue of intervention requests
pub struct InterventionQueue {
    config: InterventionConfig,
    state: Mutex<QueueState>,
    ledger: ErrorLedger,
    fanout: Arc<NotificationFanout>,
}

impl InterventionQueue {
    pub fn new(
        config: InterventionConfig,
        ledger: ErrorLedger,
        fanout: Arc<NotificationFanout>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            ledger,
            fanout,
        }
    }

    pub fn config(&self) -> &InterventionConfig {
        &self.config
    }

    /// File a request for `event`. Returns the new request id.
    pub async fn request(
        &self,
        event: &ErrorEvent,
        intervention_type: InterventionType,
        priority: Priority,
        timeout: Duration,
    ) -> String {
        let now = Utc::now();
        let timeout_at = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        let request = {
            let mut state = self.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let request = InterventionRequest {
                id: format!("int-{}", Uuid::new_v4()),
                error_id: event.id.clone(),
                error_kind: event.kind,
                component: event.component.clone(),
                error_message: event.message.clone(),
                intervention_type,
                priority,
                status: InterventionStatus::Pending,
                title: format!("{} required: {}", intervention_type, event.kind),
                description: format!(
                    "{} on {} after {} attempt(s): {}",
                    event.kind, event.component, event.attempt_count, event.message
                ),
                created_at: now,
                timeout_at,
                assignee: None,
                assigned_at: None,
                started_at: None,
                completed_at: None,
                escalated_at: None,
                resolution: None,
                notes: None,
                escalation_count: 0,
                sequence,
            };

            state.pending.insert(request.queue_key());
            state.requests.insert(request.id.clone(), request.clone());
            state.stats.total_requested += 1;
            request
        };

        warn!(
            intervention_id = %request.id,
            error_id = %request.error_id,
            kind = %request.error_kind,
            priority = %request.priority,
            "🙋 intervention requested"
        );

        self.notify(
            NotificationKind::InterventionRequested,
            &request,
            format!("{}. {}", request.title, request.description),
        )
        .await;

        request.id
    }

    /// pending → assigned
    pub async fn assign(
        &self,
        id: &str,
        assignee: &str,
    ) -> Result<InterventionRequest, InterventionError> {
        let request = self.lock().assign(id, assignee)?;
        self.announce_assignment(&request, assignee).await;
        Ok(request)
    }

    /// Assign the head of the pending queue
    pub async fn claim_next(&self, assignee: &str) -> Result<InterventionRequest, InterventionError> {
        let request = {
            let mut state = self.lock();
            let next = state
                .pending
                .first()
                .map(|(_, _, id)| id.clone())
                .ok_or(InterventionError::EmptyQueue)?;
            state.assign(&next, assignee)?
        };
        self.announce_assignment(&request, assignee).await;
        Ok(request)
    }

    async fn announce_assignment(&self, request: &InterventionRequest, assignee: &str) {
        info!(intervention_id = %request.id, assignee, "intervention assigned");
        self.notify(
            NotificationKind::InterventionAssigned,
            request,
            format!("{} assigned to {}", request.title, assignee),
        )
        .await;
    }

    /// assigned → in-progress
    pub async fn start(&self, id: &str) -> Result<InterventionRequest, InterventionError> {
        let request = {
            let mut state = self.lock();
            let request = state.get_mut(id)?;
            if request.status != InterventionStatus::Assigned {
                return Err(InterventionError::InvalidTransition {
                    id: id.to_string(),
                    from: request.status,
                    action: "start",
                });
            }
            request.status = InterventionStatus::InProgress;
            request.started_at = Some(Utc::now());
            request.clone()
        };

        info!(intervention_id = %id, "intervention in progress");
        self.notify(
            NotificationKind::InterventionStarted,
            &request,
            format!("{} is in progress", request.title),
        )
        .await;
        Ok(request)
    }

    /// assigned | in-progress → completed | failed.
    ///
    /// A successful completion resolves the linked error event.
    pub async fn complete(
        &self,
        id: &str,
        resolution: &str,
        success: bool,
        notes: Option<&str>,
    ) -> Result<InterventionRequest, InterventionError> {
        let status = if success {
            InterventionStatus::Completed
        } else {
            InterventionStatus::Failed
        };

        let request = {
            let mut state = self.lock();
            let request = state.get_mut(id)?;
            if !request.status.is_active() {
                return Err(InterventionError::InvalidTransition {
                    id: id.to_string(),
                    from: request.status,
                    action: "complete",
                });
            }
            request.resolution = Some(resolution.to_string());
            request.notes = notes.map(str::to_string);
            state.finish(id, status, self.config.history_capacity)?
        };

        if success {
            self.ledger.resolve(&request.error_id);
            info!(intervention_id = %id, error_id = %request.error_id, "✅ intervention completed");
        } else {
            warn!(intervention_id = %id, resolution, "❌ intervention failed");
        }

        let kind = if success {
            NotificationKind::InterventionCompleted
        } else {
            NotificationKind::InterventionFailed
        };
        self.notify(kind, &request, format!("{}: {}", request.title, resolution))
            .await;
        Ok(request)
    }

    /// Change the priority of a pending or active request
    pub async fn escalate(
        &self,
        id: &str,
        new_priority: Priority,
    ) -> Result<InterventionRequest, InterventionError> {
        let (request, previous) = {
            let mut state = self.lock();
            let request = state.get_mut(id)?;
            if request.status.is_terminal() {
                return Err(InterventionError::InvalidTransition {
                    id: id.to_string(),
                    from: request.status,
                    action: "escalate",
                });
            }

            let old_key = request.queue_key();
            let previous = request.priority;
            request.priority = new_priority;
            request.escalated_at = Some(Utc::now());
            request.escalation_count += 1;
            let new_key = request.queue_key();
            let updated = request.clone();

            if state.pending.remove(&old_key) {
                state.pending.insert(new_key);
            }
            (updated, previous)
        };

        warn!(
            intervention_id = %id,
            from = %previous,
            to = %new_priority,
            "⬆️  intervention escalated"
        );
        self.notify(
            NotificationKind::InterventionEscalated,
            &request,
            format!("{} escalated from {} to {}", request.title, previous, new_priority),
        )
        .await;
        Ok(request)
    }

    /// Any non-terminal state → cancelled
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<InterventionRequest, InterventionError> {
        let request = {
            let mut state = self.lock();
            let request = state.get_mut(id)?;
            if request.status.is_terminal() {
                return Err(InterventionError::InvalidTransition {
                    id: id.to_string(),
                    from: request.status,
                    action: "cancel",
                });
            }
            request.resolution = Some(reason.to_string());
            state.finish(id, InterventionStatus::Cancelled, self.config.history_capacity)?
        };

        info!(intervention_id = %id, reason, "intervention cancelled");
        self.notify(
            NotificationKind::InterventionCancelled,
            &request,
            format!("{} cancelled: {}", request.title, reason),
        )
        .await;
        Ok(request)
    }

    /// Expire every request past its deadline. Returns the expired ids.
    pub async fn sweep_timeouts(&self) -> Vec<String> {
        self.sweep_timeouts_at(Utc::now()).await
    }

    /// Expire requests overdue at `now`
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<InterventionRequest> = {
            let mut state = self.lock();
            let overdue: Vec<String> = state
                .requests
                .values()
                .filter(|r| r.is_overdue(now))
                .map(|r| r.id.clone())
                .collect();

            overdue
                .iter()
                .filter_map(|id| {
                    state
                        .finish(id, InterventionStatus::Timeout, self.config.history_capacity)
                        .ok()
                })
                .collect()
        };

        for request in &expired {
            warn!(
                intervention_id = %request.id,
                priority = %request.priority,
                "⏰ intervention timed out"
            );
            self.notify(
                NotificationKind::InterventionTimeout,
                request,
                format!("{} was not handled before {}", request.title, request.timeout_at),
            )
            .await;
        }

        expired.into_iter().map(|r| r.id).collect()
    }

    /// Run the timeout sweep every `interval` until `token` is cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("intervention sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let expired = queue.sweep_timeouts().await;
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "sweeper expired interventions");
                        }
                    }
                }
            }
        })
    }

    /// Requests matching `filter`, pending ones in queue order first.
    /// Overdue requests are expired before listing.
    pub async fn list(&self, filter: ListFilter) -> Vec<InterventionRequest> {
        self.sweep_timeouts().await;

        let state = self.lock();
        let pending = state
            .pending
            .iter()
            .filter_map(|(_, _, id)| state.requests.get(id))
            .cloned();

        match filter {
            ListFilter::Pending => pending.collect(),
            ListFilter::Active => {
                let mut active: Vec<_> = state
                    .requests
                    .values()
                    .filter(|r| r.status.is_active())
                    .cloned()
                    .collect();
                active.sort_by_key(|r| (Reverse(r.priority), r.sequence));
                active
            }
            ListFilter::All => {
                let mut rest: Vec<_> = state
                    .requests
                    .values()
                    .filter(|r| r.status != InterventionStatus::Pending)
                    .cloned()
                    .collect();
                rest.sort_by_key(|r| r.sequence);
                pending.chain(rest).collect()
            }
        }
    }

    /// Pending requests in pop order
    pub fn pending_in_order(&self) -> Vec<InterventionRequest> {
        let state = self.lock();
        state
            .pending
            .iter()
            .filter_map(|(_, _, id)| state.requests.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<InterventionRequest> {
        self.lock().requests.get(id).cloned()
    }

    /// Current status, or `None` once the request has aged out of retention
    pub fn status_of(&self, id: &str) -> Option<InterventionStatus> {
        self.lock().requests.get(id).map(|r| r.status)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.pending = state.pending.len();
        stats.active = state
            .requests
            .values()
            .filter(|r| r.status.is_active())
            .count();
        stats
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn notify(&self, kind: NotificationKind, request: &InterventionRequest, message: String) {
        let notification = Notification::new(kind, request.title.clone(), message)
            .with_intervention(request.snapshot())
            .with_data("intervention_type", request.intervention_type.as_str())
            .with_data("error_id", request.error_id.clone());
        self.fanout.broadcast(notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::model::{ErrorReport, RecoveryStrategy};

    fn queue() -> (InterventionQueue, ErrorLedger, Arc<NotificationFanout>) {
        let ledger = ErrorLedger::new(100);
        let fanout = Arc::new(NotificationFanout::new(&NotificationConfig::default()));
        let queue = InterventionQueue::new(InterventionConfig::default(), ledger.clone(), fanout.clone());
        (queue, ledger, fanout)
    }

    fn event(ledger: &ErrorLedger, kind: ErrorKind) -> ErrorEvent {
        let report = ErrorReport::new(kind, "worker-pool", "boom");
        let event = ErrorEvent::from_report(&report, RecoveryStrategy::ManualIntervention, 0);
        ledger.insert(event.clone());
        event
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let (queue, ledger, _) = queue();
        let e = event(&ledger, ErrorKind::NetworkError);

        let low = queue.request(&e, InterventionType::Maintenance, Priority::Low, HOUR).await;
        let high1 = queue.request(&e, InterventionType::Maintenance, Priority::High, HOUR).await;
        let medium = queue.request(&e, InterventionType::Maintenance, Priority::Medium, HOUR).await;
        let high2 = queue.request(&e, InterventionType::Maintenance, Priority::High, HOUR).await;
        let critical = queue.request(&e, InterventionType::Emergency, Priority::Critical, HOUR).await;

        let order: Vec<_> = queue.pending_in_order().into_iter().map(|r| r.id).collect();
        assert_eq!(order, vec![critical, high1.clone(), high2, medium, low]);

        let claimed = queue.claim_next("alice").await.unwrap();
        assert_eq!(claimed.id, order[0]);
        assert_eq!(queue.pending_in_order()[0].id, high1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_take_distinct_requests() {
        let (queue, ledger, _) = queue();
        let queue = Arc::new(queue);
        let e = event(&ledger, ErrorKind::WorkerCrashed);
        for _ in 0..8 {
            queue.request(&e, InterventionType::Maintenance, Priority::High, HOUR).await;
        }

        let claims = (0..8).map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next(&format!("operator-{}", i)).await })
        });
        let mut claimed: Vec<String> = futures::future::join_all(claims)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().id)
            .collect();

        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 8);
        assert!(matches!(
            queue.claim_next("late").await,
            Err(InterventionError::EmptyQueue)
        ));
        assert_eq!(queue.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_full_lifecycle_resolves_event() {
        let (queue, ledger, fanout) = queue();
        let e = event(&ledger, ErrorKind::CaptchaChallenge);

        let id = queue
            .request(&e, InterventionType::Captcha, Priority::High, HOUR)
            .await;
        assert!(id.starts_with("int-"));

        queue.assign(&id, "bob").await.unwrap();
        queue.start(&id).await.unwrap();
        let done = queue
            .complete(&id, "solved captcha", true, Some("took 2 minutes"))
            .await
            .unwrap();

        assert_eq!(done.status, InterventionStatus::Completed);
        assert_eq!(done.assignee.as_deref(), Some("bob"));
        assert_eq!(done.notes.as_deref(), Some("took 2 minutes"));
        assert!(done.completed_at.is_some());
        assert!(ledger.get(&e.id).unwrap().resolved);

        let kinds: Vec<_> = fanout.history().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::InterventionRequested,
                NotificationKind::InterventionAssigned,
                NotificationKind::InterventionStarted,
                NotificationKind::InterventionCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_completion_leaves_event_open() {
        let (queue, ledger, _) = queue();
        let e = event(&ledger, ErrorKind::SecurityChallenge);
        let id = queue.request(&e, InterventionType::Security, Priority::Urgent, HOUR).await;

        queue.assign(&id, "carol").await.unwrap();
        let failed = queue.complete(&id, "could not verify", false, None).await.unwrap();

        assert_eq!(failed.status, InterventionStatus::Failed);
        assert!(!ledger.get(&e.id).unwrap().resolved);
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (queue, ledger, _) = queue();
        let e = event(&ledger, ErrorKind::ProxyFailure);
        let id = queue.request(&e, InterventionType::Configuration, Priority::Medium, HOUR).await;

        // cannot complete or start while pending
        assert!(matches!(
            queue.complete(&id, "x", true, None).await,
            Err(InterventionError::InvalidTransition { from: InterventionStatus::Pending, .. })
        ));
        assert!(queue.start(&id).await.is_err());

        queue.assign(&id, "dave").await.unwrap();
        // cannot assign twice
        assert!(queue.assign(&id, "erin").await.is_err());

        queue.complete(&id, "rotated proxy", true, None).await.unwrap();
        // terminal states are final
        assert!(queue.escalate(&id, Priority::Critical).await.is_err());
        assert!(queue.cancel(&id, "late").await.is_err());

        assert_eq!(
            queue.assign("int-missing", "x").await,
            Err(InterventionError::NotFound("int-missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_escalate_resorts_pending() {
        let (queue, ledger, fanout) = queue();
        let e = event(&ledger, ErrorKind::RateLimited);

        let first = queue.request(&e, InterventionType::Configuration, Priority::Medium, HOUR).await;
        let second = queue.request(&e, InterventionType::Configuration, Priority::Low, HOUR).await;

        let escalated = queue.escalate(&second, Priority::Urgent).await.unwrap();
        assert_eq!(escalated.escalation_count, 1);
        assert!(escalated.escalated_at.is_some());

        let order: Vec<_> = queue.pending_in_order().into_iter().map(|r| r.id).collect();
        assert_eq!(order, vec![second, first]);
        assert_eq!(
            fanout.history().last().map(|r| r.kind),
            Some(NotificationKind::InterventionEscalated)
        );
    }

    #[tokio::test]
    async fn test_escalate_active_request() {
        let (queue, ledger, _) = queue();
        let e = event(&ledger, ErrorKind::DeviceOffline);
        let id = queue.request(&e, InterventionType::Maintenance, Priority::High, HOUR).await;
        queue.assign(&id, "frank").await.unwrap();

        let escalated = queue.escalate(&id, Priority::Critical).await.unwrap();
        assert_eq!(escalated.status, InterventionStatus::Assigned);
        assert_eq!(escalated.priority, Priority::Critical);
        assert!(queue.pending_in_order().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_sweep() {
        let (queue, ledger, fanout) = queue();
        let e = event(&ledger, ErrorKind::VerificationTimeout);

        let short = queue
            .request(&e, InterventionType::Verification, Priority::Medium, Duration::from_secs(60))
            .await;
        let long = queue.request(&e, InterventionType::Verification, Priority::Medium, HOUR).await;
        queue.assign(&short, "gina").await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        let expired = queue.sweep_timeouts_at(later).await;

        assert_eq!(expired, vec![short.clone()]);
        assert_eq!(queue.status_of(&short), Some(InterventionStatus::Timeout));
        assert_eq!(queue.status_of(&long), Some(InterventionStatus::Pending));
        assert_eq!(queue.stats().timed_out, 1);
        assert_eq!(
            fanout.history().last().map(|r| r.kind),
            Some(NotificationKind::InterventionTimeout)
        );

        // a second sweep does not re-expire
        assert!(queue.sweep_timeouts_at(later).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (queue, ledger, _) = queue();
        let e = event(&ledger, ErrorKind::LinkLost);

        let a = queue.request(&e, InterventionType::Maintenance, Priority::High, HOUR).await;
        let b = queue.request(&e, InterventionType::Maintenance, Priority::High, HOUR).await;
        let c = queue.request(&e, InterventionType::Maintenance, Priority::Low, HOUR).await;
        queue.assign(&b, "hank").await.unwrap();
        queue.cancel(&c, "duplicate").await.unwrap();

        let pending: Vec<_> = queue.list(ListFilter::Pending).await.into_iter().map(|r| r.id).collect();
        assert_eq!(pending, vec![a.clone()]);

        let active: Vec<_> = queue.list(ListFilter::Active).await.into_iter().map(|r| r.id).collect();
        assert_eq!(active, vec![b.clone()]);

        let all: Vec<_> = queue.list(ListFilter::All).await.into_iter().map(|r| r.id).collect();
        assert_eq!(all, vec![a, b, c]);

        assert_eq!("active".parse::<ListFilter>(), Ok(ListFilter::Active));
        assert!("done".parse::<ListFilter>().is_err());
    }

    #[tokio::test]
    async fn test_retention_drops_oldest_terminal() {
        let ledger = ErrorLedger::new(100);
        let fanout = Arc::new(NotificationFanout::new(&NotificationConfig::default()));
        let config = InterventionConfig {
            history_capacity: 2,
            ..Default::default()
        };
        let queue = InterventionQueue::new(config, ledger.clone(), fanout);
        let e = event(&ledger, ErrorKind::NetworkError);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = queue.request(&e, InterventionType::Maintenance, Priority::Low, HOUR).await;
            queue.cancel(&id, "noise").await.unwrap();
            ids.push(id);
        }

        assert!(queue.get(&ids[0]).is_none());
        assert!(queue.get(&ids[1]).is_some());
        assert!(queue.get(&ids[2]).is_some());
        assert_eq!(queue.stats().cancelled, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let (queue, _, _) = queue();
        let queue = Arc::new(queue);
        let token = CancellationToken::new();

        let handle = queue.spawn_sweeper(Duration::from_secs(30), token.clone());
        tokio::time::advance(Duration::from_secs(90)).await;
        token.cancel();

        handle.await.unwrap();
    }
}
