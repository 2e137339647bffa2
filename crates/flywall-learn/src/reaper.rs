//! Periodic flow expiry
//!
//! Flows are rebuilt from observation, never persisted, so the reaper
//! simply sweeps idle entries. The task runs until shutdown and drains
//! deterministically.

use std::sync::Arc;
use std::time::Duration;

use flywall_common::ShutdownHandle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::LearnController;

/// Default sweep interval.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the expiry task.
pub fn spawn_reaper(
    controller: Arc<LearnController>,
    interval: Duration,
    mut shutdown: ShutdownHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = controller.expire_idle();
                    if removed > 0 {
                        debug!(removed, "reaper swept idle flows");
                    }
                }
                _ = shutdown.wait() => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    })
}
