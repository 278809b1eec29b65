//! Watchdog: periodic health checks with bounded automatic restart
//!
//! Every `check_interval` the watchdog runs all registered health checkers
//! concurrently. An unhealthy component is restarted through its
//! [`RestartAction`] until `max_restart_attempts` consecutive restarts have
//! failed. At that bound exactly one intervention is filed and the component
//! is left alone until an operator completes it. A component without a
//! restart routine counts every unhealthy cycle as a failed restart.
//!
//! A supervisor wraps the check loop: a cycle that panics is logged, and the
//! loop is restarted after `loop_restart_delay`.

mod checkers;
mod policy;

pub use checkers::{CommandChecker, DiskSpaceChecker, SystemResourceChecker};
pub use policy::{ComponentSpec, WatchdogPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capabilities::{Capability, CapabilityError, Remediation};
use crate::coordinator::RecoveryCoordinator;
use crate::intervention::InterventionStatus;
use crate::model::{ErrorKind, ErrorReport, HealthStatus, InterventionType, Priority};
use crate::notification::{Notification, NotificationKind};

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("invalid watchdog policy: {0}")]
    InvalidPolicy(String),

    #[error("component '{0}' is already registered")]
    DuplicateComponent(String),

    #[error("watchdog is already running")]
    AlreadyRunning,

    #[error("watchdog is not running")]
    NotRunning,
}

/// Error a checker may return instead of a status
pub type CheckError = Box<dyn std::error::Error + Send + Sync>;

pub type CheckResult = Result<HealthStatus, CheckError>;

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self) -> CheckResult;
}

/// Named restart routine for one component
#[async_trait]
pub trait RestartAction: Send + Sync {
    async fn restart(&self) -> Result<(), CapabilityError>;
}

/// Restart routine backed by a remediation capability
pub struct CapabilityRestart {
    remediation: Arc<dyn Remediation>,
    capability: Capability,
    target: Option<String>,
}

impl CapabilityRestart {
    /// `target` is the device or worker id for capabilities that take one
    pub fn new(
        remediation: Arc<dyn Remediation>,
        capability: Capability,
        target: Option<String>,
    ) -> Self {
        Self {
            remediation,
            capability,
            target,
        }
    }
}

#[async_trait]
impl RestartAction for CapabilityRestart {
    async fn restart(&self) -> Result<(), CapabilityError> {
        let target = self.target.as_deref().unwrap_or_default();
        match self.capability {
            Capability::RestartLinkServer => self.remediation.restart_link_server().await,
            Capability::ReconnectDevice => self.remediation.reconnect_device(target).await,
            Capability::RestartWorker => self.remediation.restart_worker(target).await,
            Capability::ReleaseMemoryPressure => self.remediation.release_memory_pressure().await,
            Capability::RestartNetworkStack => self.remediation.restart_network_stack().await,
        }
    }
}

/// A component under watch
#[derive(Clone)]
pub struct WatchedComponent {
    name: String,
    kind: ErrorKind,
    checker: Arc<dyn HealthChecker>,
    restart: Option<Arc<dyn RestartAction>>,
    report_sustained: bool,
}

impl WatchedComponent {
    /// `kind` classifies the component's failures in reports and interventions
    pub fn new(name: impl Into<String>, kind: ErrorKind, checker: Arc<dyn HealthChecker>) -> Self {
        Self {
            name: name.into(),
            kind,
            checker,
            restart: None,
            report_sustained: false,
        }
    }

    pub fn with_restart(mut self, restart: Arc<dyn RestartAction>) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Also report the component to the coordinator once it has been
    /// unhealthy for `sustained_failure_cycles` cycles in a row
    pub fn report_sustained(mut self) -> Self {
        self.report_sustained = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartRecord {
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub last: Option<HealthStatus>,
    pub restart_attempts: u32,
    pub consecutive_failures: u32,
    /// Intervention blocking automatic restarts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub running: bool,
    pub paused: bool,
    pub uptime_secs: Option<u64>,
    pub cycles: u64,
    pub check_failures: u64,
    pub restarts: u64,
    pub failed_restarts: u64,
    pub interventions_filed: u64,
    pub components: BTreeMap<String, ComponentStatus>,
    pub recent_restarts: Vec<RestartRecord>,
}

/// Totals for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub unhealthy: usize,
    pub restarted: usize,
    pub escalated: usize,
    /// Skipped because the coordinator was not running
    pub skipped: bool,
}

#[derive(Debug, Default)]
struct ComponentState {
    last: Option<HealthStatus>,
    restart_attempts: u32,
    consecutive_failures: u32,
    intervention: Option<String>,
    /// The fresh critical intervention after a failed one has been filed
    reescalated: bool,
}

#[derive(Debug, Default)]
struct WatchdogState {
    components: HashMap<String, ComponentState>,
    history: VecDeque<RestartRecord>,
    cycles: u64,
    check_failures: u64,
    restarts: u64,
    failed_restarts: u64,
    interventions_filed: u64,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// What to do about one unhealthy component
enum Action {
    Nothing,
    /// `None` when the component has no restart routine; counts as a failed restart
    Restart(Option<Arc<dyn RestartAction>>, u32),
    Escalate(Priority),
}

struct Inner {
    policy: WatchdogPolicy,
    coordinator: RecoveryCoordinator,
    components: RwLock<BTreeMap<String, WatchedComponent>>,
    state: Mutex<WatchdogState>,
    paused: AtomicBool,
    running: Mutex<Option<Running>>,
    /// Cycles the loop should fail before checking
    #[cfg(test)]
    fail_cycles: std::sync::atomic::AtomicU32,
}

#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new(policy: WatchdogPolicy, coordinator: RecoveryCoordinator) -> Result<Self, WatchdogError> {
        policy.validate().map_err(WatchdogError::InvalidPolicy)?;

        Ok(Self {
            inner: Arc::new(Inner {
                policy,
                coordinator,
                components: RwLock::new(BTreeMap::new()),
                state: Mutex::new(WatchdogState::default()),
                paused: AtomicBool::new(false),
                running: Mutex::new(None),
                #[cfg(test)]
                fail_cycles: std::sync::atomic::AtomicU32::new(0),
            }),
        })
    }

    pub fn policy(&self) -> &WatchdogPolicy {
        &self.inner.policy
    }

    pub fn register(&self, component: WatchedComponent) -> Result<(), WatchdogError> {
        let mut components = self
            .inner
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if components.contains_key(&component.name) {
            return Err(WatchdogError::DuplicateComponent(component.name));
        }
        debug!(component = %component.name, "watching component");
        components.insert(component.name.clone(), component);
        Ok(())
    }

    /// Register the system resource and disk checkers when the policy asks for them
    pub fn register_builtin_checkers(&self) -> Result<(), WatchdogError> {
        let policy = &self.inner.policy;
        if !policy.builtin_checkers {
            return Ok(());
        }

        self.register(
            WatchedComponent::new(
                "system-resources",
                ErrorKind::SystemOverload,
                Arc::new(SystemResourceChecker::new(
                    "system-resources",
                    policy.cpu_threshold_percent,
                    policy.memory_threshold_percent,
                )),
            )
            .report_sustained(),
        )?;
        self.register(WatchedComponent::new(
            "disk-space",
            ErrorKind::SystemOverload,
            Arc::new(DiskSpaceChecker::new(
                "disk-space",
                policy.disk_warning_percent,
                policy.disk_critical_percent,
            )),
        ))
    }

    /// Register the `[[watchdog.components]]` entries of the policy
    pub fn register_configured(&self, remediation: &Arc<dyn Remediation>) -> Result<(), WatchdogError> {
        for spec in self.inner.policy.components.clone() {
            let mut component = WatchedComponent::new(
                spec.name.clone(),
                spec.kind,
                Arc::new(CommandChecker::new(spec.name.clone(), spec.check_command.clone())),
            );
            if let Some(capability) = spec.restart {
                component = component.with_restart(Arc::new(CapabilityRestart::new(
                    remediation.clone(),
                    capability,
                    spec.target.clone(),
                )));
            }
            if spec.report_sustained {
                component = component.report_sustained();
            }
            self.register(component)?;
        }
        Ok(())
    }

    /// Spawn the supervised check loop
    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut running = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(WatchdogError::AlreadyRunning);
        }

        // emergency stop ends the watchdog too
        let token = self.inner.coordinator.cancellation_token().child_token();
        let handle = tokio::spawn(self.clone().supervise(token.clone()));
        *running = Some(Running {
            token,
            handle,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&self) -> Result<(), WatchdogError> {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WatchdogError::NotRunning)?;

        running.token.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "watchdog task ended abnormally");
        }
        info!("🐕 Watchdog stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Skip cycles until [`resume`](Self::resume); the loop keeps running
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!("⏸️  Watchdog paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("▶️  Watchdog resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WatchdogStatus {
        let (running, uptime_secs) = {
            let guard = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(r) if !r.handle.is_finished() => (true, Some(r.started_at.elapsed().as_secs())),
                _ => (false, None),
            }
        };

        let state = self.state();
        let components = state
            .components
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    ComponentStatus {
                        last: c.last.clone(),
                        restart_attempts: c.restart_attempts,
                        consecutive_failures: c.consecutive_failures,
                        blocked_by: c.intervention.clone(),
                    },
                )
            })
            .collect();

        let skip = state
            .history
            .len()
            .saturating_sub(self.inner.policy.recent_restarts);

        WatchdogStatus {
            running,
            paused: self.is_paused(),
            uptime_secs,
            cycles: state.cycles,
            check_failures: state.check_failures,
            restarts: state.restarts,
            failed_restarts: state.failed_restarts,
            interventions_filed: state.interventions_filed,
            components,
            recent_restarts: state.history.iter().skip(skip).cloned().collect(),
        }
    }

    async fn supervise(self, token: CancellationToken) {
        let policy = &self.inner.policy;
        info!(
            "🐕 Watchdog active | Interval: {}s | Max Restarts: {} | Components: {}",
            policy.check_interval_s,
            policy.max_restart_attempts,
            self.inner
                .components
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        );

        loop {
            match AssertUnwindSafe(self.check_loop(&token)).catch_unwind().await {
                Ok(()) => return,
                Err(panic) => {
                    error!(
                        panic = %crate::error::panic_message(panic.as_ref()),
                        delay_s = policy.loop_restart_delay_s,
                        "💥 watchdog cycle panicked, restarting loop"
                    );
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(policy.loop_restart_delay()) => {}
            }
        }
    }

    async fn check_loop(&self, token: &CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.policy.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            if self.is_paused() {
                debug!("watchdog paused, skipping cycle");
                continue;
            }
            #[cfg(test)]
            if self
                .inner
                .fail_cycles
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("cycle failure");
            }
            self.run_cycle().await;
        }
    }

    /// Run one check cycle now.
    ///
    /// Public so that tests and operators can drive the watchdog without the
    /// timer.
    pub async fn run_cycle(&self) -> CycleReport {
        let state = self.inner.coordinator.state();
        if !state.accepts_work() {
            debug!(%state, "system not running, skipping watchdog cycle");
            return CycleReport {
                skipped: true,
                ..Default::default()
            };
        }

        let components: Vec<WatchedComponent> = self
            .inner
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let timeout = self.inner.policy.check_timeout();
        let checks = components.iter().map(|component| {
            let checker = component.checker.clone();
            let name = component.name.clone();
            async move {
                let handle = tokio::spawn(async move { tokio::time::timeout(timeout, checker.check()).await });
                match handle.await {
                    Ok(Ok(Ok(mut status))) => {
                        status.component = name;
                        status
                    }
                    Ok(Ok(Err(e))) => HealthStatus::unhealthy(name, e.to_string()),
                    Ok(Err(_)) => {
                        HealthStatus::unhealthy(name, format!("health check timed out after {:?}", timeout))
                    }
                    Err(e) if e.is_panic() => HealthStatus::unhealthy(
                        name,
                        format!(
                            "health check panicked: {}",
                            crate::error::panic_message(e.into_panic().as_ref())
                        ),
                    ),
                    Err(e) => HealthStatus::unhealthy(name, format!("health check aborted: {}", e)),
                }
            }
        });
        let statuses = join_all(checks).await;

        self.state().cycles += 1;

        let mut report = CycleReport {
            checked: statuses.len(),
            ..Default::default()
        };
        for (component, status) in components.iter().zip(statuses) {
            if !status.healthy {
                report.unhealthy += 1;
            }
            match self.evaluate(component, status).await {
                Some(true) => report.restarted += 1,
                Some(false) => report.escalated += 1,
                None => {}
            }
        }

        debug!(
            checked = report.checked,
            unhealthy = report.unhealthy,
            restarted = report.restarted,
            escalated = report.escalated,
            "watchdog cycle complete"
        );
        report
    }

    /// Returns `Some(true)` after a successful restart, `Some(false)` after
    /// filing an intervention
    async fn evaluate(&self, component: &WatchedComponent, status: HealthStatus) -> Option<bool> {
        let name = component.name.as_str();
        let queue = self.inner.coordinator.queue().clone();
        let healthy = status.healthy;
        let message = status.message.clone();

        let action = {
            let mut state = self.state();
            if !healthy {
                state.check_failures += 1;
            }
            let sustained = self.inner.policy.sustained_failure_cycles;
            let cs = state.components.entry(name.to_string()).or_default();
            cs.last = Some(status);

            if healthy {
                cs.consecutive_failures = 0;
                if let Some(id) = cs.intervention.clone() {
                    if matches!(queue.status_of(&id), Some(InterventionStatus::Completed) | None) {
                        debug!(component = name, intervention_id = %id, "healthy after completed intervention");
                        cs.intervention = None;
                        cs.reescalated = false;
                        cs.restart_attempts = 0;
                    }
                }
                return None;
            }

            cs.consecutive_failures += 1;
            warn!(component = name, failures = cs.consecutive_failures, message = %message, "⚠️  component unhealthy");

            if component.report_sustained && cs.consecutive_failures == sustained {
                let coordinator = self.inner.coordinator.clone();
                let report = ErrorReport::new(component.kind, name, message.clone())
                    .with_context("source", "watchdog")
                    .with_context("consecutive_failures", sustained);
                tokio::spawn(async move {
                    coordinator.report_error(report).await;
                });
            }

            match cs.intervention.clone() {
                Some(id) => match queue.status_of(&id) {
                    Some(InterventionStatus::Completed) | None => {
                        info!(component = name, intervention_id = %id, "intervention completed, auto-restart re-enabled");
                        cs.intervention = None;
                        cs.reescalated = false;
                        cs.restart_attempts = 0;
                        Self::next_restart(component, cs)
                    }
                    Some(s) if s.is_terminal() && !cs.reescalated => Action::Escalate(Priority::Critical),
                    Some(_) => Action::Nothing,
                },
                None if cs.restart_attempts >= self.inner.policy.max_restart_attempts => {
                    Action::Escalate(Priority::High)
                }
                None => Self::next_restart(component, cs),
            }
        };

        match action {
            Action::Nothing => None,
            Action::Restart(restart, attempt) => self.restart(component, restart, attempt).await,
            Action::Escalate(priority) => {
                self.escalate(component, &message, priority).await;
                Some(false)
            }
        }
    }

    fn next_restart(component: &WatchedComponent, cs: &ComponentState) -> Action {
        Action::Restart(component.restart.clone(), cs.restart_attempts + 1)
    }

    async fn restart(
        &self,
        component: &WatchedComponent,
        restart: Option<Arc<dyn RestartAction>>,
        attempt: u32,
    ) -> Option<bool> {
        let name = component.name.as_str();
        let result = match restart {
            Some(restart) => {
                info!(component = name, attempt, "🔄 restarting component");
                match tokio::spawn(async move { restart.restart().await }).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(e) if e.is_panic() => Err(format!(
                        "restart panicked: {}",
                        crate::error::panic_message(e.into_panic().as_ref())
                    )),
                    Err(e) => Err(format!("restart aborted: {}", e)),
                }
            }
            None => Err("no restart routine registered".to_string()),
        };

        let success = result.is_ok();
        let message = match &result {
            Ok(()) => "restarted".to_string(),
            Err(e) => e.clone(),
        };

        let reached_bound = {
            let mut state = self.state();
            let max = self.inner.policy.max_restart_attempts;
            let capacity = self.inner.policy.history_capacity;

            state.history.push_back(RestartRecord {
                component: name.to_string(),
                timestamp: Utc::now(),
                attempt,
                success,
                message: message.clone(),
            });
            while state.history.len() > capacity {
                state.history.pop_front();
            }

            if success {
                state.restarts += 1;
            } else {
                state.failed_restarts += 1;
            }

            let cs = state.components.entry(name.to_string()).or_default();
            if success {
                cs.restart_attempts = 0;
                false
            } else {
                cs.restart_attempts += 1;
                cs.restart_attempts >= max
            }
        };

        if success {
            info!(component = name, attempt, "✅ component restarted");
            let notification = Notification::new(
                NotificationKind::ComponentRestarted,
                format!("{} restarted", name),
                format!("automatic restart succeeded on attempt {}", attempt),
            )
            .with_data("component", name);
            self.inner.coordinator.fanout().broadcast(notification).await;
            return Some(true);
        }

        warn!(component = name, attempt, error = %message, "❌ component restart failed");
        if reached_bound {
            self.escalate(component, &message, Priority::High).await;
            return Some(false);
        }
        None
    }

    async fn escalate(&self, component: &WatchedComponent, message: &str, priority: Priority) {
        let name = component.name.as_str();
        let attempts = self.state().components.get(name).map(|c| c.restart_attempts).unwrap_or(0);

        let report = ErrorReport::new(
            component.kind,
            name,
            format!("{} unhealthy after {} restart attempt(s): {}", name, attempts, message),
        )
        .with_context("source", "watchdog");

        let id = self
            .inner
            .coordinator
            .escalate_directly(
                report,
                InterventionType::Maintenance,
                priority,
                self.inner.policy.intervention_timeout(),
            )
            .await;

        error!(component = name, intervention_id = %id, %priority, "🚨 auto-restart disabled, operator needed");

        let mut state = self.state();
        state.interventions_filed += 1;
        let cs = state.components.entry(name.to_string()).or_default();
        if priority == Priority::Critical {
            cs.reescalated = true;
        }
        cs.intervention = Some(id);
    }

    fn state(&self) -> MutexGuard<'_, WatchdogState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::notification::NotificationFanout;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Flaky {
        healthy: AtomicBool,
        checks: AtomicU32,
    }

    #[async_trait]
    impl HealthChecker for Flaky {
        async fn check(&self) -> CheckResult {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(HealthStatus::healthy("", "ok"))
            } else {
                Ok(HealthStatus::unhealthy("", "not responding"))
            }
        }
    }

    struct Restarter {
        succeed: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RestartAction for Restarter {
        async fn restart(&self) -> Result<(), CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CapabilityError::Failed {
                    capability: Capability::RestartLinkServer,
                    message: "port in use".to_string(),
                })
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl HealthChecker for Panicking {
        async fn check(&self) -> CheckResult {
            panic!("checker bug")
        }
    }

    fn setup(max_restarts: u32) -> (Watchdog, RecoveryCoordinator) {
        let config = WardenConfig::default();
        let fanout = Arc::new(NotificationFanout::new(&config.notifications));
        let coordinator = RecoveryCoordinator::from_config(&config, fanout);
        let policy = WatchdogPolicy {
            check_interval_s: 5,
            max_restart_attempts: max_restarts,
            builtin_checkers: false,
            ..Default::default()
        };
        (Watchdog::new(policy, coordinator.clone()).unwrap(), coordinator)
    }

    fn flaky(healthy: bool) -> Arc<Flaky> {
        Arc::new(Flaky {
            healthy: AtomicBool::new(healthy),
            checks: AtomicU32::new(0),
        })
    }

    fn restarter(succeed: bool) -> Arc<Restarter> {
        Arc::new(Restarter {
            succeed: AtomicBool::new(succeed),
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_invalid_policy_rejected() {
        let config = WardenConfig::default();
        let fanout = Arc::new(NotificationFanout::new(&config.notifications));
        let coordinator = RecoveryCoordinator::from_config(&config, fanout);
        let policy = WatchdogPolicy {
            max_restart_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            Watchdog::new(policy, coordinator),
            Err(WatchdogError::InvalidPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_component_rejected() {
        let (watchdog, _) = setup(3);
        let component = WatchedComponent::new("link", ErrorKind::LinkLost, flaky(true));
        watchdog.register(component.clone()).unwrap();
        assert!(matches!(
            watchdog.register(component),
            Err(WatchdogError::DuplicateComponent(_))
        ));
    }

    #[tokio::test]
    async fn test_successful_restart_resets_counter() {
        let (watchdog, coordinator) = setup(3);
        let restart = restarter(true);
        watchdog
            .register(
                WatchedComponent::new("link-server", ErrorKind::LinkLost, flaky(false))
                    .with_restart(restart.clone()),
            )
            .unwrap();

        let report = watchdog.run_cycle().await;
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.restarted, 1);

        let status = watchdog.status();
        assert_eq!(status.restarts, 1);
        assert_eq!(status.components["link-server"].restart_attempts, 0);
        assert_eq!(status.recent_restarts.len(), 1);
        assert!(status.recent_restarts[0].success);

        let kinds: Vec<_> = coordinator.fanout().history().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::ComponentRestarted]);
    }

    #[tokio::test]
    async fn test_restart_bound_files_one_intervention() {
        let (watchdog, coordinator) = setup(3);
        let restart = restarter(false);
        watchdog
            .register(
                WatchedComponent::new("worker-pool", ErrorKind::WorkerCrashed, flaky(false))
                    .with_restart(restart.clone()),
            )
            .unwrap();

        for _ in 0..3 {
            watchdog.run_cycle().await;
        }
        assert_eq!(restart.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.queue().stats().total_requested, 1);

        // blocked: no more restarts, no more interventions
        for _ in 0..5 {
            watchdog.run_cycle().await;
        }
        assert_eq!(restart.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.queue().stats().total_requested, 1);

        let status = watchdog.status();
        let blocked_by = status.components["worker-pool"].blocked_by.clone().unwrap();
        let request = coordinator.queue().get(&blocked_by).unwrap();
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.intervention_type, InterventionType::Maintenance);
        assert_eq!(status.failed_restarts, 3);
    }

    #[tokio::test]
    async fn test_completed_intervention_reenables_restart() {
        let (watchdog, coordinator) = setup(2);
        let restart = restarter(false);
        watchdog
            .register(
                WatchedComponent::new("link-server", ErrorKind::LinkLost, flaky(false))
                    .with_restart(restart.clone()),
            )
            .unwrap();

        watchdog.run_cycle().await;
        watchdog.run_cycle().await;
        let id = watchdog.status().components["link-server"].blocked_by.clone().unwrap();

        let queue = coordinator.queue();
        queue.assign(&id, "bob").await.unwrap();
        queue.complete(&id, "replaced cable", true, None).await.unwrap();

        restart.succeed.store(true, Ordering::SeqCst);
        let report = watchdog.run_cycle().await;
        assert_eq!(report.restarted, 1);
        assert_eq!(restart.calls.load(Ordering::SeqCst), 3);
        assert!(watchdog.status().components["link-server"].blocked_by.is_none());
    }

    #[tokio::test]
    async fn test_failed_intervention_reescalates_once_as_critical() {
        let (watchdog, coordinator) = setup(1);
        watchdog
            .register(
                WatchedComponent::new("device-hub", ErrorKind::DeviceOffline, flaky(false))
                    .with_restart(restarter(false)),
            )
            .unwrap();

        watchdog.run_cycle().await;
        let first = watchdog.status().components["device-hub"].blocked_by.clone().unwrap();

        let queue = coordinator.queue();
        queue.cancel(&first, "operator unavailable").await.unwrap();

        watchdog.run_cycle().await;
        let second = watchdog.status().components["device-hub"].blocked_by.clone().unwrap();
        assert_ne!(first, second);
        assert_eq!(queue.get(&second).unwrap().priority, Priority::Critical);

        queue.cancel(&second, "still unavailable").await.unwrap();
        watchdog.run_cycle().await;
        watchdog.run_cycle().await;
        assert_eq!(queue.stats().total_requested, 2);
    }

    #[tokio::test]
    async fn test_panicking_checker_is_unhealthy() {
        let (watchdog, _) = setup(3);
        watchdog
            .register(WatchedComponent::new("bad", ErrorKind::NetworkError, Arc::new(Panicking)))
            .unwrap();
        watchdog
            .register(WatchedComponent::new("good", ErrorKind::NetworkError, flaky(true)))
            .unwrap();

        let report = watchdog.run_cycle().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.unhealthy, 1);

        let status = watchdog.status();
        let bad = status.components["bad"].last.clone().unwrap();
        assert!(!bad.healthy);
        assert!(bad.message.contains("checker bug"));
        assert_eq!(bad.component, "bad");
        assert!(status.components["good"].last.as_ref().unwrap().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_failure_reported_to_coordinator() {
        let (watchdog, coordinator) = setup(5);
        watchdog
            .register(
                WatchedComponent::new("vpn", ErrorKind::VpnFailure, flaky(false)).report_sustained(),
            )
            .unwrap();

        for _ in 0..3 {
            watchdog.run_cycle().await;
        }
        // the report runs on its own task
        tokio::time::sleep(Duration::from_millis(10)).await;

        let counts = coordinator.ledger().counts();
        assert_eq!(counts.by_kind.get("vpn-failure"), Some(&1));
    }

    #[tokio::test]
    async fn test_missing_restart_routine_escalates_at_bound() {
        let (watchdog, coordinator) = setup(3);
        watchdog
            .register(WatchedComponent::new("disk-space", ErrorKind::SystemOverload, flaky(false)))
            .unwrap();

        watchdog.run_cycle().await;
        watchdog.run_cycle().await;
        let status = watchdog.status();
        assert_eq!(status.components["disk-space"].restart_attempts, 2);
        assert_eq!(status.failed_restarts, 2);
        assert_eq!(coordinator.queue().stats().total_requested, 0);

        let report = watchdog.run_cycle().await;
        assert_eq!(report.escalated, 1);
        for _ in 0..10 {
            watchdog.run_cycle().await;
        }

        let status = watchdog.status();
        assert_eq!(status.interventions_filed, 1);
        assert_eq!(status.failed_restarts, 3);
        assert!(status.recent_restarts.iter().all(|r| !r.success));
        let id = status.components["disk-space"].blocked_by.clone().unwrap();
        let request = coordinator.queue().get(&id).unwrap();
        assert_eq!(request.error_kind, ErrorKind::SystemOverload);
        assert_eq!(coordinator.queue().stats().total_requested, 1);
    }

    #[tokio::test]
    async fn test_cycle_skipped_while_system_paused() {
        let (watchdog, coordinator) = setup(3);
        let checker = flaky(true);
        watchdog
            .register(WatchedComponent::new("link", ErrorKind::LinkLost, checker.clone()))
            .unwrap();

        coordinator.pause_system("maintenance window").await;
        assert!(watchdog.run_cycle().await.skipped);
        assert_eq!(checker.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_and_pause() {
        let (watchdog, _) = setup(3);
        let checker = flaky(true);
        watchdog
            .register(WatchedComponent::new("link", ErrorKind::LinkLost, checker.clone()))
            .unwrap();

        watchdog.start().unwrap();
        assert!(matches!(watchdog.start(), Err(WatchdogError::AlreadyRunning)));

        // first tick is immediate, then every 5s
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(checker.checks.load(Ordering::SeqCst), 3);

        watchdog.pause();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(checker.checks.load(Ordering::SeqCst), 3);

        watchdog.resume();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(checker.checks.load(Ordering::SeqCst) > 3);

        assert!(watchdog.status().running);
        watchdog.stop().await.unwrap();
        assert!(!watchdog.is_running());
        assert!(matches!(watchdog.stop().await, Err(WatchdogError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_restarts_after_failed_cycle() {
        let (watchdog, _) = setup(3);
        let checker = flaky(true);
        watchdog
            .register(WatchedComponent::new("link", ErrorKind::LinkLost, checker.clone()))
            .unwrap();
        watchdog.inner.fail_cycles.store(1, Ordering::SeqCst);

        watchdog.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(checker.checks.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_running());

        // loop_restart_delay is 5s, then the fresh loop ticks immediately
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(checker.checks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(checker.checks.load(Ordering::SeqCst), 2);
        assert!(watchdog.status().running);
        watchdog.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_ends_watchdog() {
        let (watchdog, coordinator) = setup(3);
        watchdog.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        coordinator.emergency_stop("operator").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!watchdog.is_running());
    }
}
