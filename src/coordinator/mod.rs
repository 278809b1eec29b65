/*!
 * Recovery Coordinator
 *
 * Every collaborator reports failures here. The coordinator correlates the
 * report with an error event, invokes the handler registered for its kind,
 * applies backoff after an unsuccessful attempt and escalates to the
 * intervention queue once the attempt budget is spent.
 *
 * ```text
 * report ──> state gate ──> pattern detector ──> ledger.acquire
 *               │ (paused)                            │
 *               v                                     v
 *          record only                attempt > max? ──yes──> intervention
 *                                             │ no
 *                                             v
 *                              handler (deadline) ──ok──> resolved
 *                                             │ failed
 *                                             v
 *                                      backoff, unresolved
 * ```
 *
 * The coordinator is a cheap handle; clones share one state.
 */

mod handlers;
mod ledger;
mod pattern;

pub use handlers::{
    handler_fn, CooldownHandler, FnHandler, HandlerContext, HandlerError, HandlerResult,
    ManualOnlyHandler, NetworkHandler, RecoveryHandler, RestartHandler, SystemicHandler,
};
pub use ledger::{Acquired, ErrorCounts, ErrorLedger};
pub use pattern::{PatternDetector, PatternTrigger};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_core_resilience::{
    BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry, RetryExecutor,
};

use crate::capabilities::Remediation;
use crate::config::{RecoveryConfig, WardenConfig};
use crate::intervention::{InterventionQueue, QueueStats};
use crate::model::{
    ErrorEvent, ErrorKind, ErrorReport, InterventionType, Priority, RecoveryStrategy, SystemState,
};
use crate::notification::{Notification, NotificationFanout, NotificationKind};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("system is in emergency stop")]
    EmergencyStopped,

    #[error("no handler registered for {0}")]
    UnhandledKind(ErrorKind),

    #[error("handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// What `handle_error` did with a report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RecoveryOutcome {
    /// The handler resolved the event
    Resolved { error_id: String, attempt: u32 },
    /// The attempt failed; `delay` was waited before returning
    Unresolved {
        error_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// The attempt budget was spent and an operator was asked to act
    Escalated {
        error_id: String,
        intervention_id: String,
    },
    /// The system was not running; the report was recorded only
    Suppressed { error_id: String, state: SystemState },
}

impl RecoveryOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, RecoveryOutcome::Resolved { .. })
    }

    pub fn error_id(&self) -> &str {
        match self {
            RecoveryOutcome::Resolved { error_id, .. }
            | RecoveryOutcome::Unresolved { error_id, .. }
            | RecoveryOutcome::Escalated { error_id, .. }
            | RecoveryOutcome::Suppressed { error_id, .. } => error_id,
        }
    }
}

/// Read-only view returned by [`RecoveryCoordinator::get_status`]
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub state: SystemState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub state_changed_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub counts: ErrorCounts,
    pub unresolved: Vec<ErrorEvent>,
    pub recent_events: Vec<ErrorEvent>,
    pub interventions: QueueStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub handlers: BTreeMap<String, RecoveryStrategy>,
}

struct Registration {
    strategy: RecoveryStrategy,
    handler: Arc<dyn RecoveryHandler>,
}

struct StateInfo {
    reason: Option<String>,
    changed_at: DateTime<Utc>,
}

struct Inner {
    config: RecoveryConfig,
    ledger: ErrorLedger,
    queue: Arc<InterventionQueue>,
    fanout: Arc<NotificationFanout>,
    handlers: RwLock<HashMap<ErrorKind, Registration>>,
    detector: Mutex<PatternDetector>,
    state: watch::Sender<SystemState>,
    state_info: Mutex<StateInfo>,
    started_at: Instant,
    cancel: CancellationToken,
    breakers: CircuitBreakerRegistry,
    retry: RetryExecutor,
}

/// Releases ownership of an event however the flow ends
struct InFlight<'a> {
    ledger: &'a ErrorLedger,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ledger.release(&self.id);
    }
}

#[derive(Clone)]
pub struct RecoveryCoordinator {
    inner: Arc<Inner>,
}

impl RecoveryCoordinator {
    /// Build a coordinator over an existing ledger and queue.
    ///
    /// `ledger` must be the handle the queue was built with, so that
    /// completing an intervention resolves the linked event.
    pub fn new(
        config: RecoveryConfig,
        breaker: CircuitBreakerConfig,
        ledger: ErrorLedger,
        queue: Arc<InterventionQueue>,
        fanout: Arc<NotificationFanout>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let detector = PatternDetector::new(
            config.pattern_same_kind,
            config.pattern_window_count,
            config.pattern_window(),
        );
        let (state, _) = watch::channel(SystemState::Running);

        Self {
            inner: Arc::new(Inner {
                ledger,
                queue,
                fanout,
                handlers: RwLock::new(HashMap::new()),
                detector: Mutex::new(detector),
                state,
                state_info: Mutex::new(StateInfo {
                    reason: None,
                    changed_at: Utc::now(),
                }),
                started_at: Instant::now(),
                retry: RetryExecutor::with_cancellation(cancel.child_token()),
                cancel,
                breakers: CircuitBreakerRegistry::new(breaker),
                config,
            }),
        }
    }

    /// Build the ledger and queue from `config` and wire them together
    pub fn from_config(config: &WardenConfig, fanout: Arc<NotificationFanout>) -> Self {
        let ledger = ErrorLedger::new(config.recovery.history_capacity);
        let queue = Arc::new(InterventionQueue::new(
            config.interventions.clone(),
            ledger.clone(),
            fanout.clone(),
        ));
        Self::new(
            config.recovery.clone(),
            config.breaker.to_breaker_config(),
            ledger,
            queue,
            fanout,
        )
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.inner.ledger
    }

    pub fn queue(&self) -> &Arc<InterventionQueue> {
        &self.inner.queue
    }

    pub fn fanout(&self) -> &Arc<NotificationFanout> {
        &self.inner.fanout
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.inner.retry
    }

    /// Token cancelled by emergency stop
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn state(&self) -> SystemState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SystemState> {
        self.inner.state.subscribe()
    }

    /// Wait until the system accepts work again.
    ///
    /// Automation flows call this before starting their next action.
    pub async fn wait_until_running(&self) -> Result<(), RecoveryError> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| s.accepts_work() || s.is_terminal())
            .await
            .map_err(|_| RecoveryError::EmergencyStopped)?;

        if state.is_terminal() {
            Err(RecoveryError::EmergencyStopped)
        } else {
            Ok(())
        }
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn register_handler(
        &self,
        kind: ErrorKind,
        strategy: RecoveryStrategy,
        handler: Arc<dyn RecoveryHandler>,
    ) {
        let previous = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Registration { strategy, handler });

        if previous.is_some() {
            debug!(%kind, %strategy, "recovery handler replaced");
        } else {
            debug!(%kind, %strategy, "recovery handler registered");
        }
    }

    /// Register the capability-backed handler for every kind
    pub fn install_default_handlers(&self, remediation: Arc<dyn Remediation>) {
        let config = &self.inner.config;
        for kind in ErrorKind::ALL {
            let handler: Arc<dyn RecoveryHandler> = match kind {
                ErrorKind::LinkLost | ErrorKind::DeviceOffline | ErrorKind::WorkerCrashed => {
                    Arc::new(RestartHandler::new(remediation.clone()))
                }
                ErrorKind::VpnFailure | ErrorKind::ProxyFailure => Arc::new(NetworkHandler::new(
                    remediation.clone(),
                    Some(config.short_retry_delay()),
                )),
                ErrorKind::NetworkError => Arc::new(NetworkHandler::new(remediation.clone(), None)),
                ErrorKind::VerificationTimeout | ErrorKind::RateLimited => {
                    Arc::new(CooldownHandler::new(config.cooldown()))
                }
                ErrorKind::SecurityChallenge | ErrorKind::CaptchaChallenge => {
                    Arc::new(ManualOnlyHandler)
                }
                ErrorKind::MemoryPressure | ErrorKind::SystemOverload => Arc::new(
                    SystemicHandler::new(remediation.clone(), config.systemic_cooldown()),
                ),
            };
            self.register_handler(kind, config.kind_policy(kind).strategy, handler);
        }
        info!("🛡️  default recovery handlers installed for {} kinds", ErrorKind::ALL.len());
    }

    /// Report a failure; true when it was resolved by this call
    pub async fn report_error(&self, report: ErrorReport) -> bool {
        self.handle_error(report).await.is_resolved()
    }

    /// Process one failure report end to end
    pub async fn handle_error(&self, report: ErrorReport) -> RecoveryOutcome {
        let inner = &self.inner;
        let (policy, registration) = self.policy_for(report.kind);

        let state = self.state();
        if !state.accepts_work() {
            let event = inner.ledger.record_suppressed(&report, policy);
            debug!(error_id = %event.id, kind = %report.kind, %state, "report recorded while not running");
            return RecoveryOutcome::Suppressed {
                error_id: event.id,
                state,
            };
        }

        let trigger = inner
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(report.kind);
        if let Some(trigger) = trigger {
            warn!(%trigger, "repeated failure pattern detected");
            self.pause_system(&format!("repeated failures: {}", trigger)).await;
        }

        let acquired = inner.ledger.acquire(&report, policy);
        let _owner = InFlight {
            ledger: &inner.ledger,
            id: acquired.event.id.clone(),
        };

        let event = inner
            .ledger
            .update(&acquired.event.id, |e| e.attempt_count += 1)
            .unwrap_or_else(|| {
                let mut event = acquired.event.clone();
                event.attempt_count += 1;
                event
            });

        debug!(
            error_id = %event.id,
            kind = %event.kind,
            component = %event.component,
            attempt = event.attempt_count,
            max_attempts = event.max_attempts,
            "handling error"
        );

        if event.attempt_count > event.max_attempts {
            let intervention_id = self.escalate_event(&event, "attempt budget exhausted").await;
            return RecoveryOutcome::Escalated {
                error_id: event.id,
                intervention_id,
            };
        }

        let Some(registration) = registration else {
            let reason = RecoveryError::UnhandledKind(event.kind).to_string();
            let intervention_id = self.escalate_event(&event, &reason).await;
            return RecoveryOutcome::Escalated {
                error_id: event.id,
                intervention_id,
            };
        };

        let ctx = HandlerContext::new(event.clone(), self.clone());
        let deadline = inner.config.handler_timeout();
        let handled = AssertUnwindSafe(registration.handle(&ctx)).catch_unwind();

        let failure = match tokio::time::timeout(deadline, handled).await {
            Ok(Ok(Ok(true))) => {
                inner.ledger.resolve(&event.id);
                info!(error_id = %event.id, kind = %event.kind, attempt = event.attempt_count, "✅ error resolved");
                return RecoveryOutcome::Resolved {
                    error_id: event.id,
                    attempt: event.attempt_count,
                };
            }
            Ok(Ok(Ok(false))) => None,
            Ok(Ok(Err(e))) => Some(RecoveryError::Handler(e)),
            Ok(Err(panic)) => Some(RecoveryError::HandlerPanicked(crate::error::panic_message(panic.as_ref()))),
            Err(_) => Some(RecoveryError::HandlerTimeout(deadline)),
        };

        let last_error = failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "handler reported failure".to_string());
        inner
            .ledger
            .update(&event.id, |e| e.last_error = Some(last_error.clone()));

        if self.state().is_terminal() {
            return RecoveryOutcome::Unresolved {
                error_id: event.id,
                attempt: event.attempt_count,
                delay: Duration::ZERO,
            };
        }

        let delay = inner
            .config
            .retry_policy()
            .jittered_delay(event.attempt_count, &mut rand::rng());
        warn!(
            error_id = %event.id,
            kind = %event.kind,
            attempt = event.attempt_count,
            max_attempts = event.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "recovery attempt failed"
        );

        let waited = tokio::select! {
            _ = inner.cancel.cancelled() => Duration::ZERO,
            _ = tokio::time::sleep(delay) => delay,
        };

        RecoveryOutcome::Unresolved {
            error_id: event.id,
            attempt: event.attempt_count,
            delay: waited,
        }
    }

    /// Record an already-escalated failure and file an intervention for it
    pub async fn escalate_directly(
        &self,
        report: ErrorReport,
        intervention_type: InterventionType,
        priority: Priority,
        timeout: Duration,
    ) -> String {
        let (policy, _) = self.policy_for(report.kind);
        let event = ErrorEvent::from_report(&report, RecoveryStrategy::Escalate, policy.max_attempts);
        self.inner.ledger.insert(event.clone());

        let intervention_id = self
            .inner
            .queue
            .request(&event, intervention_type, priority, timeout)
            .await;
        self.inner.ledger.mark_escalated(&event.id, &intervention_id);

        warn!(
            error_id = %event.id,
            %intervention_id,
            component = %event.component,
            "⬆️  escalated directly to an operator"
        );
        intervention_id
    }

    /// Pause automatic recovery. Returns false if nothing changed.
    pub async fn pause_system(&self, reason: &str) -> bool {
        let changed = self.transition(SystemState::Paused, reason, |from| {
            !from.is_terminal() && from != SystemState::Paused
        });
        if changed {
            warn!(reason, "⏸️  system paused");
            self.broadcast_state(NotificationKind::SystemPaused, "System paused", reason)
                .await;
        }
        changed
    }

    /// Resume from paused, maintenance or recovering
    pub async fn resume_system(&self) -> Result<bool, RecoveryError> {
        if self.state().is_terminal() {
            return Err(RecoveryError::EmergencyStopped);
        }
        let changed = self.transition(SystemState::Running, "resumed by operator", |from| {
            !from.is_terminal() && from != SystemState::Running
        });
        if changed {
            self.reset_pattern_detector();
            info!("▶️  system resumed");
            self.broadcast_state(NotificationKind::SystemResumed, "System resumed", "resumed by operator")
                .await;
        }
        Ok(changed)
    }

    /// Stop everything for the rest of this run
    pub async fn emergency_stop(&self, reason: &str) -> bool {
        let changed = self.transition(SystemState::EmergencyStop, reason, |from| !from.is_terminal());
        if changed {
            self.inner.cancel.cancel();
            error!(reason, "🛑 EMERGENCY STOP");
            self.broadcast_state(NotificationKind::SystemEmergencyStop, "Emergency stop", reason)
                .await;
        }
        changed
    }

    /// Operator-requested pause for planned work
    pub async fn enter_maintenance(&self, reason: &str) -> Result<bool, RecoveryError> {
        if self.state().is_terminal() {
            return Err(RecoveryError::EmergencyStopped);
        }
        let changed = self.transition(SystemState::Maintenance, reason, |from| {
            !from.is_terminal() && from != SystemState::Maintenance
        });
        if changed {
            warn!(reason, "🔧 system entered maintenance");
            self.broadcast_state(NotificationKind::SystemPaused, "Maintenance", reason)
                .await;
        }
        Ok(changed)
    }

    /// Running → recovering, for systemic cleanup
    pub(crate) async fn begin_recovery(&self, reason: &str) -> bool {
        let changed = self.transition(SystemState::Recovering, reason, |from| {
            from == SystemState::Running
        });
        if changed {
            warn!(reason, "🧹 system recovering");
            self.broadcast_state(NotificationKind::SystemPaused, "System recovering", reason)
                .await;
        }
        changed
    }

    /// Recovering → running once cleanup has cooled down
    pub(crate) async fn end_recovery(&self) -> bool {
        let changed = self.transition(SystemState::Running, "recovery complete", |from| {
            from == SystemState::Recovering
        });
        if changed {
            self.reset_pattern_detector();
            info!("▶️  recovery complete, system running");
            self.broadcast_state(NotificationKind::SystemResumed, "System resumed", "recovery complete")
                .await;
        }
        changed
    }

    /// Snapshot of the whole engine; available in every state
    pub fn get_status(&self) -> SystemStatus {
        let inner = &self.inner;
        let (reason, state_changed_at) = {
            let info = self.state_info();
            (info.reason.clone(), info.changed_at)
        };

        let handlers = inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(kind, r)| (kind.as_str().to_string(), r.strategy))
            .collect();

        SystemStatus {
            state: self.state(),
            reason,
            state_changed_at,
            uptime_secs: inner.started_at.elapsed().as_secs(),
            counts: inner.ledger.counts(),
            unresolved: inner.ledger.unresolved(),
            recent_events: inner.ledger.recent(inner.config.recent_events),
            interventions: inner.queue.stats(),
            breakers: inner.breakers.snapshots(),
            handlers,
        }
    }

    fn policy_for(&self, kind: ErrorKind) -> (crate::config::KindPolicy, Option<Arc<dyn RecoveryHandler>>) {
        let mut policy = self.inner.config.kind_policy(kind);
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let handler = handlers.get(&kind).map(|r| {
            policy.strategy = r.strategy;
            r.handler.clone()
        });
        (policy, handler)
    }

    async fn escalate_event(&self, event: &ErrorEvent, reason: &str) -> String {
        let kind = event.kind;
        let intervention_id = self
            .inner
            .queue
            .request(
                event,
                kind.intervention_type(),
                kind.escalation_priority(),
                kind.escalation_timeout(),
            )
            .await;
        self.inner.ledger.mark_escalated(&event.id, &intervention_id);

        error!(
            error_id = %event.id,
            %kind,
            attempts = event.attempt_count,
            %intervention_id,
            reason,
            "⬆️  escalated to intervention"
        );

        if kind.is_systemic() {
            self.pause_system(&format!("{} escalated", kind)).await;
        }
        intervention_id
    }

    fn transition<P>(&self, to: SystemState, reason: &str, allowed: P) -> bool
    where
        P: FnOnce(SystemState) -> bool,
    {
        let changed = self.inner.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            let mut info = self.state_info();
            info.reason = (to != SystemState::Running).then(|| reason.to_string());
            info.changed_at = Utc::now();
        }
        changed
    }

    fn reset_pattern_detector(&self) {
        self.inner
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    async fn broadcast_state(&self, kind: NotificationKind, title: &str, reason: &str) {
        let notification = Notification::new(kind, title, reason)
            .with_data("state", self.state().as_str());
        self.inner.fanout.broadcast(notification).await;
    }

    fn state_info(&self) -> MutexGuard<'_, StateInfo> {
        self.inner
            .state_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
