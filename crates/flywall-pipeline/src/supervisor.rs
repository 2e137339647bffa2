//! Crash classification and the safe-mode gate
//!
//! Prior exits are classified into graceful stops and crashes. A small
//! rolling window persists in the state store; too many crashes in the
//! window gates the next boot into safe mode: a minimal management-only
//! configuration, the offending configuration left untouched, and the
//! staged pipeline disabled until an operator clears the gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flywall_common::{Config, Platform, Result, RuleAction, RuleConfig, ZoneConfig};
use flywall_store::StateStore;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Bucket persisting the exit-event window.
pub const BUCKET_SUPERVISOR: &str = "supervisor_events";
const KEY_WINDOW: &str = "window";

/// Rolling window length.
pub const DEFAULT_WINDOW: usize = 8;
/// Crashes within the window that trigger safe mode.
pub const DEFAULT_CRASH_THRESHOLD: usize = 3;

/// How the previous process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Process exit code.
    Code(i32),
    /// Terminated by signal.
    Signal(i32),
    /// Runtime panic.
    Panic,
}

/// Classification of one exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitKind {
    Graceful,
    Crash,
}

/// Classify an exit. The graceful stop signals are not crashes;
/// forced kills and panics are.
pub fn classify(status: ExitStatus) -> ExitKind {
    match status {
        ExitStatus::Code(0) => ExitKind::Graceful,
        // SIGTERM and SIGINT are the orderly stop paths.
        ExitStatus::Signal(15) | ExitStatus::Signal(2) => ExitKind::Graceful,
        ExitStatus::Signal(_) => ExitKind::Crash,
        ExitStatus::Panic => ExitKind::Crash,
        ExitStatus::Code(_) => ExitKind::Crash,
    }
}

/// One recorded exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitEvent {
    pub kind: ExitKind,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// Boot decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Normal,
    SafeMode,
}

/// Exit recorder and safe-mode gate.
pub struct Supervisor {
    platform: Platform,
    store: Arc<StateStore>,
    window: usize,
    threshold: usize,
    safe_mode: AtomicBool,
}

impl Supervisor {
    pub fn new(platform: Platform, store: Arc<StateStore>) -> Arc<Self> {
        Self::with_limits(platform, store, DEFAULT_WINDOW, DEFAULT_CRASH_THRESHOLD)
    }

    pub fn with_limits(
        platform: Platform,
        store: Arc<StateStore>,
        window: usize,
        threshold: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            store,
            window: window.max(1),
            threshold: threshold.max(1),
            safe_mode: AtomicBool::new(false),
        })
    }

    /// Record one exit into the persisted rolling window.
    pub fn record_exit(&self, status: ExitStatus, detail: &str) -> Result<ExitEvent> {
        let event = ExitEvent {
            kind: classify(status),
            at: DateTime::from_timestamp_nanos(self.platform.now_ns() as i64),
            detail: detail.to_string(),
        };
        let mut events = self.events();
        events.push(event.clone());
        let start = events.len().saturating_sub(self.window);
        let window: Vec<&ExitEvent> = events[start..].iter().collect();
        let value = serde_json::to_string(&window)?;
        self.store.put(BUCKET_SUPERVISOR, KEY_WINDOW, &value)?;
        Ok(event)
    }

    /// The persisted window, oldest first.
    pub fn events(&self) -> Vec<ExitEvent> {
        self.store
            .get(BUCKET_SUPERVISOR, KEY_WINDOW)
            .and_then(|entry| serde_json::from_str(&entry.value).ok())
            .unwrap_or_default()
    }

    /// Decide the boot mode from the window. Entering safe mode is loud
    /// and machine-greppable.
    pub fn check_boot(&self) -> BootMode {
        let crashes = self
            .events()
            .iter()
            .filter(|e| e.kind == ExitKind::Crash)
            .count();
        if crashes >= self.threshold {
            self.safe_mode.store(true, Ordering::SeqCst);
            error!(
                crashes,
                threshold = self.threshold,
                "ENTERING SAFE MODE: repeated crashes detected; management-only configuration loaded"
            );
            metrics::counter!("flywall_safe_mode_entries_total").increment(1);
            BootMode::SafeMode
        } else {
            info!(crashes, "boot check passed");
            BootMode::Normal
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    /// Operator action: re-enable the pipeline.
    pub fn clear_safe_mode(&self) {
        self.safe_mode.store(false, Ordering::SeqCst);
        info!("safe mode cleared by operator");
    }

    /// Minimal management-only configuration loaded in safe mode. The
    /// offending configuration on disk is left untouched.
    pub fn safe_mode_config() -> Config {
        Config {
            zones: vec![ZoneConfig {
                name: "management".to_string(),
                interfaces: vec!["lo".to_string()],
                cidrs: vec!["127.0.0.0/8".to_string()],
            }],
            policies: vec![flywall_common::PolicyConfig {
                name: "management-access".to_string(),
                from_zone: "management".to_string(),
                to_zone: None,
                rules: vec![RuleConfig {
                    name: "allow-management".to_string(),
                    proto: None,
                    src: None,
                    dst: None,
                    src_ports: vec![],
                    dst_ports: vec![],
                    in_iface: None,
                    out_iface: None,
                    invert_src: false,
                    invert_dst: false,
                    action: RuleAction::Accept,
                }],
            }],
            ..Default::default()
        }
    }
}
