//! Background supervisor.
//!
//! Owns the lifecycle around the workflow runner:
//! - a heartbeat loop that keeps the wake lock renewed while any workflow
//!   runs ("supervisor alive" means this loop is alive)
//! - per-workflow interval alarms that revive dead loops
//! - a watchdog that restarts a dead supervisor unless the user stopped it
//! - startup recovery of workflows flagged as running
//!
//! The last explicit user action (start or stop) is persisted in the
//! settings table so recovery and the watchdog honour it across restarts.

pub mod scheduler;
pub mod wake_lock;
pub(crate) mod watchdog;

pub use scheduler::{AlarmHandler, IntervalScheduler};
pub use wake_lock::{LeasedWakeLock, WakeLock};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::WorkflowError;
use crate::store::WorkflowStore;
use crate::workflow::model::{WorkflowDefinition, WorkflowExecutionResult};
use crate::workflow::runner::WorkflowRunner;

/// Settings key holding the last explicit user action.
pub const USER_INTENT_KEY: &str = "supervisor.user_intent";

/// Last explicit start/stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserIntent {
    Running,
    Stopped,
}

impl UserIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    /// Unknown values read as `Running`: only an explicit stop keeps
    /// the supervisor down.
    pub fn parse(value: &str) -> Self {
        match value {
            "stopped" => Self::Stopped,
            _ => Self::Running,
        }
    }
}

/// Snapshot for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub user_intent: UserIntent,
    pub wake_lock_held: bool,
    pub heartbeat_ticks: u64,
    pub running_workflows: Vec<String>,
    pub scheduled_workflows: Vec<String>,
}

/// Cloneable handle to the supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

pub(crate) struct SupervisorInner {
    runner: Arc<WorkflowRunner>,
    store: Arc<dyn WorkflowStore>,
    config: SupervisorConfig,
    wake_lock: Arc<dyn WakeLock>,
    scheduler: IntervalScheduler,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// Serializes workflow lifecycle changes against alarm and recovery
    /// restarts.
    lifecycle: Mutex<()>,
    user_stopped: AtomicBool,
    ticks: AtomicU64,
    this: Weak<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        runner: Arc<WorkflowRunner>,
        store: Arc<dyn WorkflowStore>,
        config: SupervisorConfig,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let inner = Arc::new_cyclic(|this| SupervisorInner {
            runner,
            store,
            config,
            wake_lock,
            scheduler: IntervalScheduler::new(shutdown.child_token()),
            shutdown,
            heartbeat: Mutex::new(None),
            watchdog: Mutex::new(None),
            lifecycle: Mutex::new(()),
            user_stopped: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Startup recovery. Resumes every workflow flagged as running unless
    /// the persisted intent is "stopped". Returns whether the supervisor
    /// came up.
    pub async fn recover(&self) -> Result<bool, WorkflowError> {
        let intent = self
            .inner
            .store
            .get_setting(USER_INTENT_KEY)
            .await?
            .map(|v| UserIntent::parse(&v))
            .unwrap_or(UserIntent::Running);

        self.inner.ensure_watchdog().await;
        if intent == UserIntent::Stopped {
            self.inner.user_stopped.store(true, Ordering::SeqCst);
            info!("Supervisor was stopped by the user; not resuming workflows");
            return Ok(false);
        }

        let resumed = self.inner.revive().await?;
        info!(resumed, "Supervisor recovered");
        Ok(true)
    }

    /// Explicit user start. Returns the number of workflows resumed.
    pub async fn start(&self) -> Result<usize, WorkflowError> {
        self.inner.set_intent(UserIntent::Running).await?;
        self.inner.ensure_watchdog().await;
        let resumed = self.inner.revive().await?;
        info!(resumed, "Supervisor started");
        Ok(resumed)
    }

    /// Explicit user stop. Loops and alarms stop; the per-workflow
    /// `is_running` flags are kept so the next start resumes them.
    pub async fn stop(&self) -> Result<usize, WorkflowError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.set_intent(UserIntent::Stopped).await?;
        self.inner.stop_heartbeat().await;
        let alarms = self.inner.scheduler.cancel_all().await;
        let stopped = self.inner.runner.stop_all().await;
        self.inner.wake_lock.release();
        info!(stopped, alarms, "Supervisor stopped");
        Ok(stopped)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.heartbeat_alive().await
    }

    /// Arm the interval alarm for a workflow.
    pub async fn schedule_interval(&self, id: &str, secs: u64) -> Result<(), WorkflowError> {
        self.inner.schedule_interval(id, secs).await
    }

    pub async fn cancel_interval(&self, id: &str) -> bool {
        self.inner.scheduler.cancel(id).await
    }

    /// Start a workflow's loop and alarm and flag it as running. Brings
    /// the supervisor up first when it is down.
    pub async fn start_workflow(&self, id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        let mut workflow = self.inner.load(id).await?;
        if !self.is_running().await {
            self.start().await?;
        }

        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.runner.start_workflow(workflow.clone()).await?;
        self.inner.store.set_running(id, true).await?;
        self.inner.schedule_interval(id, workflow.interval_secs).await?;
        self.inner.refresh_wake_lock(false).await;

        workflow.is_running = true;
        Ok(workflow)
    }

    /// Stop a workflow and clear its running flag. Stopping a stopped
    /// workflow succeeds.
    pub async fn stop_workflow(&self, id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        let mut workflow = self.inner.load(id).await?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        // Flag and alarm go first so nothing restarts the loop meanwhile.
        self.inner.scheduler.cancel(id).await;
        self.inner.store.set_running(id, false).await?;
        self.inner.runner.stop_workflow(id).await;
        self.inner.refresh_wake_lock(false).await;

        workflow.is_running = false;
        Ok(workflow)
    }

    /// Run one iteration now, whether or not the loop is running.
    pub async fn run_workflow(&self, id: &str) -> Result<WorkflowExecutionResult, WorkflowError> {
        let workflow = self.inner.load(id).await?;
        Ok(self.inner.runner.run_once(&workflow).await)
    }

    /// Pick up an edited definition: a live loop restarts with it and the
    /// alarm takes the new interval.
    pub async fn reload_workflow(&self, id: &str) -> Result<(), WorkflowError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.runner.is_running(id).await {
            return Ok(());
        }
        let workflow = self.inner.load(id).await?;
        self.inner.schedule_interval(id, workflow.interval_secs).await?;
        self.inner.runner.start_workflow(workflow).await?;
        info!(workflow_id = %id, "Workflow reloaded");
        Ok(())
    }

    /// Stop and delete. Returns whether the definition existed.
    pub async fn delete_workflow(&self, id: &str) -> Result<bool, WorkflowError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.scheduler.cancel(id).await;
        let deleted = self.inner.store.delete_workflow(id).await?;
        self.inner.runner.remove(id).await;
        self.inner.refresh_wake_lock(false).await;
        Ok(deleted)
    }

    pub async fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            running: self.inner.heartbeat_alive().await,
            user_intent: if self.inner.user_stopped() {
                UserIntent::Stopped
            } else {
                UserIntent::Running
            },
            wake_lock_held: self.inner.wake_lock.is_held(),
            heartbeat_ticks: self.inner.ticks.load(Ordering::SeqCst),
            running_workflows: self.inner.runner.running_ids().await,
            scheduled_workflows: self.inner.scheduler.scheduled_ids().await,
        }
    }

    /// Process exit: cancel every task. Persisted intent and running
    /// flags are left alone so the next process resumes.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.stop_heartbeat().await;
        self.inner.scheduler.cancel_all().await;
        self.inner.runner.shutdown().await;
        self.inner.wake_lock.release();
        if let Some(handle) = self.inner.watchdog.lock().await.take() {
            let _ = handle.await;
        }
        info!("Supervisor shut down");
    }

    /// Kill the heartbeat as a crash would.
    #[cfg(test)]
    pub(crate) async fn kill(&self) {
        if let Some(handle) = self.inner.heartbeat.lock().await.as_ref() {
            handle.abort();
        }
    }
}

impl SupervisorInner {
    pub(crate) async fn heartbeat_alive(&self) -> bool {
        self.heartbeat
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn user_stopped(&self) -> bool {
        self.user_stopped.load(Ordering::SeqCst)
    }

    async fn set_intent(&self, intent: UserIntent) -> Result<(), WorkflowError> {
        self.store.set_setting(USER_INTENT_KEY, intent.as_str()).await?;
        self.user_stopped
            .store(intent == UserIntent::Stopped, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound { id: id.to_string() })
    }

    async fn schedule_interval(&self, id: &str, secs: u64) -> Result<(), WorkflowError> {
        let handler: Weak<dyn AlarmHandler> = self.this.clone();
        self.scheduler.schedule(id, secs, handler).await
    }

    /// Bring the heartbeat up and resume every workflow flagged as
    /// running whose loop is gone. Returns the number resumed.
    pub(crate) async fn revive(&self) -> Result<usize, WorkflowError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkflowError::SupervisorStopped);
        }
        self.ensure_heartbeat().await;

        let _lifecycle = self.lifecycle.lock().await;
        let mut resumed = 0;
        for workflow in self.store.list_running().await? {
            let id = workflow.id.clone();
            let interval_secs = workflow.interval_secs;
            let period = Duration::from_secs(interval_secs);
            if !self.runner.is_running(&id).await {
                match self.runner.start_workflow(workflow).await {
                    Ok(()) => resumed += 1,
                    Err(e) => {
                        warn!(workflow_id = %id, error = %e, "Could not resume workflow");
                        continue;
                    }
                }
            }
            // Re-arm missing alarms and ones left on a stale interval.
            if self.scheduler.period(&id).await != Some(period)
                && let Err(e) = self.schedule_interval(&id, interval_secs).await
            {
                warn!(workflow_id = %id, error = %e, "Could not arm interval alarm");
            }
        }

        self.refresh_wake_lock(true).await;
        Ok(resumed)
    }

    async fn ensure_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *heartbeat = Some(tokio::spawn(heartbeat_loop(
            self.this.clone(),
            self.config.heartbeat_interval,
            self.shutdown.child_token(),
        )));
        debug!("Supervisor heartbeat started");
    }

    async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
    }

    async fn ensure_watchdog(&self) {
        let mut watchdog = self.watchdog.lock().await;
        if watchdog.as_ref().is_some_and(|h| !h.is_finished()) || self.shutdown.is_cancelled() {
            return;
        }
        *watchdog = Some(watchdog::spawn(
            self.this.clone(),
            self.config.watchdog_interval,
            self.shutdown.child_token(),
        ));
    }

    /// Hold the wake lock while any workflow runs. `renew` forces a
    /// re-acquire; otherwise an unexpired lease is left as is.
    async fn refresh_wake_lock(&self, renew: bool) {
        if self.runner.running_ids().await.is_empty() {
            self.wake_lock.release();
        } else if renew || !self.wake_lock.is_held() {
            self.wake_lock.acquire(self.config.wake_lock_lease);
        }
    }

    async fn on_heartbeat(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let renew = tick % u64::from(self.config.wake_lock_renew_ticks.max(1)) == 0;
        self.refresh_wake_lock(renew).await;
        debug!(tick, "Supervisor heartbeat");
    }
}

#[async_trait]
impl AlarmHandler for SupervisorInner {
    async fn on_alarm(&self, workflow_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.heartbeat_alive().await {
            if self.user_stopped() {
                return;
            }
            warn!(workflow_id, "Alarm found supervisor dead, restarting");
            if let Err(e) = self.revive().await {
                warn!(error = %e, "Alarm failed to restart supervisor");
                return;
            }
        }
        let _lifecycle = self.lifecycle.lock().await;
        if self.runner.is_running(workflow_id).await {
            return;
        }

        match self.store.get_workflow(workflow_id).await {
            Ok(Some(workflow)) if workflow.is_running => {
                warn!(workflow_id, "Alarm found workflow loop dead, restarting");
                if let Err(e) = self.runner.start_workflow(workflow).await {
                    warn!(workflow_id, error = %e, "Alarm failed to restart workflow");
                }
            }
            Ok(_) => {
                debug!(workflow_id, "Workflow no longer running, disarming alarm");
                self.scheduler.cancel(workflow_id).await;
            }
            Err(e) => warn!(workflow_id, error = %e, "Alarm could not load workflow"),
        }
    }
}

async fn heartbeat_loop(
    supervisor: Weak<SupervisorInner>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.on_heartbeat().await;
    }
}
