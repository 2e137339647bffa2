//! Atomic commit of an accepted candidate
//!
//! Order matters: the kernel transaction first (apply or revert), then
//! the decision engine swap, then the diff into the state store (which
//! the replicator broadcasts), then service reloads. A kernel failure
//! leaves everything untouched.

use std::sync::Arc;

use flywall_common::{Config, Error, Result};
use flywall_kernel::Kernel;
use flywall_policy::DecisionEngine;
use flywall_store::StateStore;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::stage::PipelineContext;

/// Bucket holding the running configuration sections.
pub const BUCKET_CONFIG: &str = "config";
/// Key holding the full running configuration document.
pub const KEY_RUNNING: &str = "running";

/// A reloadable collaborator (DHCP, DNS, QoS, ...).
///
/// `reload` must be idempotent and reports whether the service had to
/// restart. `start`/`stop` are lifecycle hooks called by the
/// supervisor.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn reload(&self, config: &Config) -> Result<bool>;
}

/// Result of one commit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub config_changes: usize,
    pub restarted_services: Vec<String>,
    pub reload_errors: Vec<String>,
}

/// Applies pipeline output to the datapath, engine, store and services.
pub struct Applier {
    kernel: Arc<dyn Kernel>,
    engine: Arc<DecisionEngine>,
    store: Arc<StateStore>,
    services: RwLock<Vec<Arc<dyn Service>>>,
}

impl Applier {
    pub fn new(
        kernel: Arc<dyn Kernel>,
        engine: Arc<DecisionEngine>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            kernel,
            engine,
            store,
            services: RwLock::new(Vec::new()),
        }
    }

    pub fn register_service(&self, service: Arc<dyn Service>) {
        self.services.write().push(service);
    }

    /// Commit a dry-run-complete pipeline context.
    pub fn commit(&self, ctx: &PipelineContext) -> Result<ApplyReport> {
        let ruleset = ctx.ruleset.as_ref().ok_or_else(|| {
            Error::internal("commit without dry run").with_attr("missing", "ruleset")
        })?;
        let compiled = ctx.compiled.clone().ok_or_else(|| {
            Error::internal("commit without dry run").with_attr("missing", "compiled policy")
        })?;

        // Single kernel transaction: on failure the prior ruleset stays
        // active and nothing else changes.
        self.kernel.apply_ruleset(ruleset)?;
        self.engine.set_policy(compiled);

        let config_changes = self.write_diff(&ctx.candidate)?;
        metrics::counter!("flywall_config_commits_total").increment(1);

        let mut report = ApplyReport {
            config_changes,
            ..Default::default()
        };
        for service in self.services.read().iter() {
            match service.reload(&ctx.candidate) {
                Ok(true) => report.restarted_services.push(service.name().to_string()),
                Ok(false) => {}
                Err(e) => {
                    warn!(service = service.name(), error = %e, "service reload failed");
                    report
                        .reload_errors
                        .push(format!("{}: {e}", service.name()));
                }
            }
        }
        info!(
            changes = report.config_changes,
            restarted = report.restarted_services.len(),
            "configuration committed"
        );
        Ok(report)
    }

    /// Write changed config sections as store changes. The replicator
    /// broadcasts whatever lands here.
    fn write_diff(&self, config: &Config) -> Result<usize> {
        let mut written = 0usize;
        let sections: Vec<(&str, String)> = vec![
            ("zones", serde_json::to_string(&config.zones)?),
            ("policies", serde_json::to_string(&config.policies)?),
            ("common_rules", serde_json::to_string(&config.common_rules)?),
            ("learning", serde_json::to_string(&config.learning)?),
            ("replication", serde_json::to_string(&config.replication)?),
            ("ha", serde_json::to_string(&config.ha)?),
            (KEY_RUNNING, serde_json::to_string(config)?),
        ];
        for (key, value) in sections {
            let unchanged = self
                .store
                .get(BUCKET_CONFIG, key)
                .map(|entry| entry.value == value)
                .unwrap_or(false);
            if !unchanged {
                self.store.put(BUCKET_CONFIG, key, &value)?;
                written += 1;
            }
        }
        Ok(written)
    }
}
