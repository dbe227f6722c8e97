//! Periodic stale-connection reaping.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::ConnectionRegistry;

impl ConnectionRegistry {
    /// Spawn the reaper task.
    ///
    /// Every `interval` the task reaps connections silent for longer than
    /// `threshold`, then pings the survivors. Pings do not count as
    /// acknowledgements; only the peer's pongs (or other traffic) refresh a
    /// connection. The task exits when `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        threshold: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(run_reaper(registry, interval, threshold, cancel))
    }
}

async fn run_reaper(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    info!(
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX),
        "reaper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = registry.reap_stale(threshold);
                let survivors = registry.handles();
                let _ = join_all(survivors.iter().map(|h| registry.ping(h))).await;
                debug!(reaped = reaped.len(), pinged = survivors.len(), "reaper pass");
            }
            () = cancel.cancelled() => {
                info!("reaper stopped");
                return;
            }
        }
    }
}
