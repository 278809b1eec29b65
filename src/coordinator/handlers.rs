//! Recovery handlers
//!
//! A handler receives a [`HandlerContext`] for one attempt at one event and
//! answers whether the failure is now resolved. The default handlers are
//! thin policies over the [`Remediation`] capabilities, each routed through a
//! per-capability circuit breaker.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core_resilience::{GuardError, RetryPolicy};

use super::RecoveryCoordinator;
use crate::capabilities::{Capability, CapabilityError, Remediation};
use crate::model::{ErrorEvent, ErrorKind, SystemState};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("circuit '{name}' is open, retry in {retry_after:?}")]
    BreakerOpen { name: String, retry_after: Duration },

    #[error("event {event_id} has no {what} to act on")]
    MissingTarget { event_id: String, what: &'static str },

    #[error("cancelled by emergency stop")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Open breakers, missing targets and cancellation are not worth another try
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Capability(_) | HandlerError::Failed(_))
    }
}

pub type HandlerResult = Result<bool, HandlerError>;

/// Everything a handler may use for one attempt
#[derive(Clone)]
pub struct HandlerContext {
    event: ErrorEvent,
    coordinator: RecoveryCoordinator,
}

impl HandlerContext {
    pub(crate) fn new(event: ErrorEvent, coordinator: RecoveryCoordinator) -> Self {
        Self { event, coordinator }
    }

    /// Snapshot of the event being handled, attempt count already incremented
    pub fn event(&self) -> &ErrorEvent {
        &self.event
    }

    pub fn coordinator(&self) -> &RecoveryCoordinator {
        &self.coordinator
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.coordinator.cancellation_token()
    }

    /// Sleep that ends early with `Cancelled` on emergency stop
    pub async fn sleep(&self, duration: Duration) -> Result<(), HandlerError> {
        let token = self.cancellation_token();
        tokio::select! {
            _ = token.cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run a capability through the breaker named `breaker`
    pub async fn guarded<F, Fut>(&self, breaker: &str, op: F) -> Result<(), HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), CapabilityError>>,
    {
        let breaker = self.coordinator.breakers().get_or_create(breaker);
        breaker.call(op).await.map_err(|e| match e {
            GuardError::Open { name, retry_after } => HandlerError::BreakerOpen { name, retry_after },
            GuardError::Inner(e) => HandlerError::Capability(e),
        })
    }

    /// Run `op` under the coordinator's retry executor
    pub async fn retried<F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<(), HandlerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        self.coordinator
            .retry_executor()
            .execute_if(name, policy, HandlerError::is_retryable, op)
            .await
    }

    fn device_id(&self) -> Result<&str, HandlerError> {
        self.event
            .device_id
            .as_deref()
            .ok_or_else(|| HandlerError::MissingTarget {
                event_id: self.event.id.clone(),
                what: "device id",
            })
    }

    fn worker_id(&self) -> Result<&str, HandlerError> {
        self.event
            .worker_id
            .as_deref()
            .ok_or_else(|| HandlerError::MissingTarget {
                event_id: self.event.id.clone(),
                what: "worker id",
            })
    }
}

/// Recovery policy for one error kind
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// `Ok(true)` resolves the event; `Ok(false)` or `Err` counts as an
    /// unsuccessful attempt.
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`RecoveryHandler`]
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler
///
/// ```no_run
/// use warden::coordinator::{handler_fn, HandlerContext};
///
/// let handler = handler_fn(|ctx: HandlerContext| async move {
///     Ok::<_, warden::coordinator::HandlerError>(ctx.event().attempt_count > 1)
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RecoveryHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult {
        (self.0)(ctx.clone()).await
    }
}

/// Scoped component restart: link server, device link or worker
pub struct RestartHandler {
    remediation: Arc<dyn Remediation>,
}

impl RestartHandler {
    pub fn new(remediation: Arc<dyn Remediation>) -> Self {
        Self { remediation }
    }
}

#[async_trait]
impl RecoveryHandler for RestartHandler {
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult {
        let r = &self.remediation;
        match ctx.event().kind {
            ErrorKind::LinkLost => {
                ctx.guarded(Capability::RestartLinkServer.as_str(), || r.restart_link_server())
                    .await?;
                if let Some(device) = ctx.event().device_id.as_deref() {
                    let name = format!("{}:{}", Capability::ReconnectDevice, device);
                    ctx.guarded(&name, || r.reconnect_device(device)).await?;
                }
            }
            ErrorKind::WorkerCrashed => {
                let worker = ctx.worker_id()?;
                let name = format!("{}:{}", Capability::RestartWorker, worker);
                ctx.guarded(&name, || r.restart_worker(worker)).await?;
            }
            _ => {
                let device = ctx.device_id()?;
                let name = format!("{}:{}", Capability::ReconnectDevice, device);
                ctx.guarded(&name, || r.reconnect_device(device)).await?;
            }
        }

        info!(error_id = %ctx.event().id, kind = %ctx.event().kind, "component restarted");
        Ok(true)
    }
}

/// Network-level recovery.
///
/// With a short delay configured (vpn and proxy failures) the restart is a
/// simple retry: one wait, then up to two tries spaced by the same delay.
pub struct NetworkHandler {
    remediation: Arc<dyn Remediation>,
    delay: Option<Duration>,
}

impl NetworkHandler {
    pub fn new(remediation: Arc<dyn Remediation>, delay: Option<Duration>) -> Self {
        Self { remediation, delay }
    }
}

#[async_trait]
impl RecoveryHandler for NetworkHandler {
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult {
        let r = &self.remediation;
        let name = Capability::RestartNetworkStack.as_str();

        match self.delay {
            Some(delay) => {
                debug!(error_id = %ctx.event().id, ?delay, "waiting before network restart");
                ctx.sleep(delay).await?;
                let policy = RetryPolicy {
                    max_attempts: 2,
                    base_delay: delay,
                    max_delay: delay,
                    backoff_factor: 1.0,
                    jitter: 0.0,
                };
                ctx.retried(name, &policy, || ctx.guarded(name, || r.restart_network_stack()))
                    .await?;
            }
            None => {
                ctx.guarded(name, || r.restart_network_stack()).await?;
            }
        }
        Ok(true)
    }
}

/// Waits out a cool-down and reports the condition cleared
pub struct CooldownHandler {
    cooldown: Duration,
}

impl CooldownHandler {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }
}

#[async_trait]
impl RecoveryHandler for CooldownHandler {
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult {
        debug!(error_id = %ctx.event().id, cooldown = ?self.cooldown, "cooling down");
        ctx.sleep(self.cooldown).await?;
        Ok(true)
    }
}

/// Security and captcha challenges: only an operator can resolve them
pub struct ManualOnlyHandler;

#[async_trait]
impl RecoveryHandler for ManualOnlyHandler {
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult {
        warn!(error_id = %ctx.event().id, kind = %ctx.event().kind, "requires an operator");
        Ok(false)
    }
}

/// Memory pressure and overload: pause into `Recovering`, release resources,
/// and resume after a cool-down
pub struct SystemicHandler {
    remediation: Arc<dyn Remediation>,
    cooldown: Duration,
}

impl SystemicHandler {
    pub fn new(remediation: Arc<dyn Remediation>, cooldown: Duration) -> Self {
        Self {
            remediation,
            cooldown,
        }
    }
}

#[async_trait]
impl RecoveryHandler for SystemicHandler {
    async fn handle(&self, ctx: &HandlerContext) -> HandlerResult {
        let coordinator = ctx.coordinator().clone();
        let entered = coordinator
            .begin_recovery(&format!("{}: {}", ctx.event().kind, ctx.event().message))
            .await;

        let r = &self.remediation;
        let released = ctx
            .guarded(Capability::ReleaseMemoryPressure.as_str(), || r.release_memory_pressure())
            .await;

        // Timed resume runs on its own so the handler deadline never cuts it short
        if entered {
            let token = coordinator.cancellation_token();
            let cooldown = self.cooldown;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(cooldown) => {
                        if coordinator.state() == SystemState::Recovering {
                            coordinator.end_recovery().await;
                        }
                    }
                }
            });
        }

        released?;
        Ok(true)
    }
}
