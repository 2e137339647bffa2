//! Configuration reload
//!
//! A SIGHUP-equivalent trigger re-reads the configuration source and
//! re-runs the pipeline with commit semantics identical to the first
//! apply. Signal wiring lives outside the core; anything holding a
//! [`ReloadHandle`] can trigger a reload.

use std::sync::Arc;

use flywall_common::{Config, Result, ShutdownHandle};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::apply::Applier;
use crate::pipeline::ConfigPipeline;

/// Produces the current on-disk configuration when a reload fires.
pub type ConfigSource = Box<dyn Fn() -> Result<Config> + Send + Sync>;

/// Trigger for the reload listener.
#[derive(Clone)]
pub struct ReloadHandle {
    notify: Arc<Notify>,
}

impl ReloadHandle {
    /// Request a reload (the SIGHUP path).
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Spawn the reload listener task.
pub fn spawn_reload_listener(
    pipeline: Arc<ConfigPipeline>,
    applier: Arc<Applier>,
    source: ConfigSource,
    shutdown: ShutdownHandle,
) -> (ReloadHandle, JoinHandle<()>) {
    let notify = Arc::new(Notify::new());
    let handle = ReloadHandle {
        notify: notify.clone(),
    };
    let mut shutdown = shutdown;
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    match reload_once(&pipeline, &applier, &source, &shutdown) {
                        Ok(()) => info!("configuration reloaded"),
                        Err(e) => warn!(error = %e, "configuration reload failed"),
                    }
                }
                _ = shutdown.wait() => return,
            }
        }
    });
    (handle, task)
}

fn reload_once(
    pipeline: &ConfigPipeline,
    applier: &Applier,
    source: &ConfigSource,
    shutdown: &ShutdownHandle,
) -> Result<()> {
    let candidate = source()?;
    let (ctx, report) = pipeline.execute(candidate, shutdown)?;
    info!(summary = %report.summary(), "reload pipeline complete");
    applier.commit(&ctx)?;
    Ok(())
}
