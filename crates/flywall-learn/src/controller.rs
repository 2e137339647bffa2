//! Learning/offload controller
//!
//! Userspace side of the IPS path. New-flow packets arrive here from
//! the kernel queue (inline) or mirror (monitoring); the controller
//! assigns verdicts and, once a flow has survived the inspection
//! window, promotes it to the kernel bypass with the offload mark.
//!
//! The controller fails open: when it is paused or unreachable the
//! datapath keeps delivering packets under an Accept default, and flows
//! already marked trusted keep their kernel bypass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use flywall_common::{FlowFlags, LearningConfig, Packet, Platform, RuleAction, Verdict};
use flywall_flow::FlowTable;
use flywall_policy::DecisionEngine;
use parking_lot::RwLock;
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::signature::SignatureSet;

/// Verdict returned to the kernel queue for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueVerdict {
    Accept,
    Drop,
    /// Accept and stamp the packet mark that installs the bypass.
    AcceptWithMark(u32),
}

/// Controller statistics, for the operator surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerStats {
    pub packets: u64,
    pub drops: u64,
    pub offloads: u64,
    pub fail_open: u64,
    pub signature_hits: u64,
}

/// Userspace learning controller.
pub struct LearnController {
    platform: Platform,
    table: Arc<FlowTable>,
    engine: Arc<DecisionEngine>,
    config: RwLock<LearningConfig>,
    signatures: RwLock<Arc<SignatureSet>>,
    paused: AtomicBool,
    /// Last-seen observations per source address, kept separate from
    /// the kernel blocklist.
    rate_seen: DashMap<IpAddr, u64>,
    packets: AtomicU64,
    drops: AtomicU64,
    offloads: AtomicU64,
    fail_open: AtomicU64,
    signature_hits: AtomicU64,
}

impl LearnController {
    pub fn new(
        platform: Platform,
        table: Arc<FlowTable>,
        engine: Arc<DecisionEngine>,
        config: LearningConfig,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            platform,
            table,
            engine,
            config: RwLock::new(config),
            signatures: RwLock::new(Arc::new(SignatureSet::default())),
            paused: AtomicBool::new(false),
            rate_seen: DashMap::new(),
            packets: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            offloads: AtomicU64::new(0),
            fail_open: AtomicU64::new(0),
            signature_hits: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&controller);
        controller
            .table
            .set_eviction_callback(Box::new(move |key, snapshot| {
                if let Some(c) = weak.upgrade() {
                    c.on_evicted(key, snapshot.verdict);
                }
            }));
        controller
    }

    /// Handle one queued packet and return the verdict for the queue.
    pub fn handle_packet(&self, pkt: &Packet, payload: &[u8]) -> QueueVerdict {
        self.packets.fetch_add(1, Ordering::Relaxed);

        if self.paused.load(Ordering::Acquire) {
            // Fail open: never blackhole flows lacking a verdict.
            self.fail_open.fetch_add(1, Ordering::Relaxed);
            warn!(
                src = %pkt.src_ip,
                dst = %pkt.dst_ip,
                "controller paused; accepting packet without verdict"
            );
            metrics::counter!("flywall_controller_fail_open_total").increment(1);
            return QueueVerdict::Accept;
        }

        let now = self.platform.now_ns();
        let cfg = self.config.read().clone();
        let ttl_ns = cfg.flow_timeout_secs * 1_000_000_000;

        self.rate_seen.insert(pkt.src_ip, now);

        let key = pkt.flow_key();
        let state = self.table.upsert(key, now, ttl_ns);
        state.record_packet(pkt.len as u64, now, ttl_ns);

        match state.verdict() {
            Verdict::Drop => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                return QueueVerdict::Drop;
            }
            Verdict::Trusted => {
                // Normally bypassed in the kernel; re-stamp the mark.
                return QueueVerdict::AcceptWithMark(cfg.offload_mark);
            }
            Verdict::Unknown => {}
        }

        // Window inspection: a signature hit is terminal.
        if !payload.is_empty() {
            state.set_flag(FlowFlags::INSPECTED);
            let signatures = self.signatures.read().clone();
            if let Some(meta) = signatures.scan(payload) {
                self.signature_hits.fetch_add(1, Ordering::Relaxed);
                debug!(signature = meta.id, %pkt.src_ip, "signature hit; dropping flow");
                metrics::counter!("flywall_signature_hits_total").increment(1);
                let _ = state.try_set_verdict(Verdict::Drop);
                self.drops.fetch_add(1, Ordering::Relaxed);
                return QueueVerdict::Drop;
            }
        }

        let decision = self.engine.decide(pkt);
        match decision.action {
            RuleAction::Drop | RuleAction::Reject => {
                let _ = state.try_set_verdict(Verdict::Drop);
                self.drops.fetch_add(1, Ordering::Relaxed);
                debug!(rule = %decision.rule_id, "flow denied");
                QueueVerdict::Drop
            }
            RuleAction::Accept => {
                if state.packets() >= cfg.inspection_window as u64 {
                    // Window served: promote and install the bypass.
                    if state.try_set_verdict(Verdict::Trusted).is_ok() {
                        state.set_offloaded();
                        self.offloads.fetch_add(1, Ordering::Relaxed);
                        debug!(rule = %decision.rule_id, "flow promoted to kernel bypass");
                        metrics::counter!("flywall_offloads_total").increment(1);
                        return QueueVerdict::AcceptWithMark(cfg.offload_mark);
                    }
                    // Lost the race to a concurrent Drop.
                    if state.verdict() == Verdict::Drop {
                        self.drops.fetch_add(1, Ordering::Relaxed);
                        return QueueVerdict::Drop;
                    }
                    QueueVerdict::AcceptWithMark(cfg.offload_mark)
                } else {
                    QueueVerdict::Accept
                }
            }
        }
    }

    /// Expire flows idle past the configured timeout. Called
    /// periodically by the reaper task.
    pub fn expire_idle(&self) -> usize {
        let cfg = self.config.read().clone();
        let now = self.platform.now_ns();
        let cutoff = now.saturating_sub(cfg.flow_timeout_secs * 1_000_000_000);
        let removed = self.table.expire_before(cutoff);
        self.rate_seen.retain(|_, last| *last >= cutoff);
        removed.len()
    }

    /// Pause the controller (operator action or watchdog). Packets keep
    /// flowing under the fail-open policy.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        warn!("learning controller paused; datapath failing open");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        debug!("learning controller resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Install a new signature set; takes effect for the next packet.
    pub fn set_signatures(&self, set: SignatureSet) {
        *self.signatures.write() = Arc::new(set);
    }

    /// Update the learning knobs without touching existing verdicts.
    pub fn set_config(&self, config: LearningConfig) {
        *self.config.write() = config;
    }

    /// Most recent observation timestamp for a source, if tracked.
    pub fn last_seen(&self, ip: IpAddr) -> Option<u64> {
        self.rate_seen.get(&ip).map(|e| *e.value())
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            packets: self.packets.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            offloads: self.offloads.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            signature_hits: self.signature_hits.load(Ordering::Relaxed),
        }
    }

    pub fn flow_table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    fn on_evicted(&self, key: &flywall_common::FlowKey, verdict: Verdict) {
        debug!(?key, ?verdict, "flow evicted from table");
        metrics::counter!("flywall_controller_evictions_total").increment(1);
    }
}
