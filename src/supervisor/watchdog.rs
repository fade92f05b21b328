//! Watchdog: periodic liveness check that restarts a dead supervisor.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SupervisorInner;

/// Spawn the watchdog. It exits when `token` is cancelled or the
/// supervisor is dropped.
pub(crate) fn spawn(
    supervisor: Weak<SupervisorInner>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Watchdog started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };

            if supervisor.heartbeat_alive().await {
                debug!("Watchdog: supervisor alive");
                continue;
            }
            if supervisor.user_stopped() {
                debug!("Watchdog: supervisor stopped by user, leaving it down");
                continue;
            }

            warn!("Watchdog detected dead supervisor, restarting");
            match supervisor.revive().await {
                Ok(resumed) => info!(resumed, "Watchdog restarted supervisor"),
                Err(e) => warn!(error = %e, "Watchdog failed to restart supervisor"),
            }
        }

        info!("Watchdog stopped");
    })
}
