//! Interval scheduler: a per-workflow alarm independent of the runner
//! loop.
//!
//! The runner loop sleeps inside its own task; if that task is killed,
//! nothing inside it will wake up again. The alarm fires on the same
//! period from a separate task and lets its handler bring the loop (or
//! the whole supervisor) back.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WorkflowError;
use crate::workflow::model::check_interval;

/// Receives alarm callbacks.
#[async_trait]
pub trait AlarmHandler: Send + Sync {
    async fn on_alarm(&self, workflow_id: &str);
}

struct Alarm {
    period: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct IntervalScheduler {
    root: CancellationToken,
    alarms: Mutex<HashMap<String, Alarm>>,
}

impl IntervalScheduler {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            alarms: Mutex::new(HashMap::new()),
        }
    }

    /// Arm (or re-arm) the alarm for `workflow_id`, first firing one
    /// period from now.
    pub async fn schedule(
        &self,
        workflow_id: &str,
        interval_secs: u64,
        handler: Weak<dyn AlarmHandler>,
    ) -> Result<(), WorkflowError> {
        check_interval(interval_secs)?;
        if self.root.is_cancelled() {
            return Err(WorkflowError::SupervisorStopped);
        }

        let period = Duration::from_secs(interval_secs);
        let mut alarms = self.alarms.lock().await;
        if let Some(old) = alarms.remove(workflow_id) {
            old.token.cancel();
            old.handle.abort();
        }

        let token = self.root.child_token();
        let handle = tokio::spawn(fire_loop(
            workflow_id.to_string(),
            period,
            handler,
            token.clone(),
        ));
        alarms.insert(
            workflow_id.to_string(),
            Alarm {
                period,
                token,
                handle,
            },
        );
        info!(workflow_id, interval_secs, "Interval alarm armed");
        Ok(())
    }

    /// Disarm one alarm. Returns whether one was armed.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        let Some(alarm) = self.alarms.lock().await.remove(workflow_id) else {
            return false;
        };
        alarm.token.cancel();
        alarm.handle.abort();
        debug!(workflow_id, "Interval alarm cancelled");
        true
    }

    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<Alarm> = self.alarms.lock().await.drain().map(|(_, a)| a).collect();
        for alarm in &drained {
            alarm.token.cancel();
            alarm.handle.abort();
        }
        drained.len()
    }

    pub async fn is_scheduled(&self, workflow_id: &str) -> bool {
        self.alarms
            .lock()
            .await
            .get(workflow_id)
            .is_some_and(|a| !a.handle.is_finished())
    }

    pub async fn period(&self, workflow_id: &str) -> Option<Duration> {
        self.alarms.lock().await.get(workflow_id).map(|a| a.period)
    }

    /// Armed workflow ids, sorted.
    pub async fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.alarms.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

async fn fire_loop(
    workflow_id: String,
    period: Duration,
    handler: Weak<dyn AlarmHandler>,
    token: CancellationToken,
) {
    let Some(first) = Instant::now().checked_add(period) else {
        warn!(workflow_id = %workflow_id, period_secs = period.as_secs(), "Alarm deadline out of range, disarming");
        return;
    };
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(handler) = handler.upgrade() else {
            debug!(workflow_id = %workflow_id, "Alarm handler gone, disarming");
            break;
        };
        debug!(workflow_id = %workflow_id, "Interval alarm fired");
        handler.on_alarm(&workflow_id).await;
    }
}
