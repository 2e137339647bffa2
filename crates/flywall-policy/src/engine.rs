//! Decision engine
//!
//! Hot path: never blocks, never allocates beyond the returned rule id.
//! The active compiled policy is swapped atomically on config commit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use flywall_common::{Packet, RuleAction};
use tracing::trace;

use crate::compile::{CompiledPolicy, CompiledRule};

/// Rule id reported when the ingress interface maps to no zone.
pub const RULE_UNKNOWN_ZONE: &str = "unknown-zone";
/// Rule id reported when no rule in any matching policy fired.
pub const RULE_DEFAULT_DROP: &str = "default-drop";

/// Engine output: the action and the identifier of what decided it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: RuleAction,
    pub rule_id: String,
}

impl Decision {
    fn drop(rule_id: &str) -> Self {
        Self {
            action: RuleAction::Drop,
            rule_id: rule_id.to_string(),
        }
    }

    /// Lowercased verdict string of the action.
    pub fn verdict(&self) -> &'static str {
        self.action.as_verdict()
    }
}

/// Evaluates packets against the active compiled policy.
pub struct DecisionEngine {
    active: ArcSwap<CompiledPolicy>,
    lookups: AtomicU64,
    drops: AtomicU64,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self {
            active: ArcSwap::from_pointee(CompiledPolicy::default()),
            lookups: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    pub fn with_policy(policy: Arc<CompiledPolicy>) -> Self {
        let engine = Self::new();
        engine.set_policy(policy);
        engine
    }

    /// Swap in a freshly compiled policy. Readers see either the old or
    /// the new policy, never a mix.
    pub fn set_policy(&self, policy: Arc<CompiledPolicy>) {
        self.active.store(policy);
    }

    /// Decide one packet.
    #[inline]
    pub fn decide(&self, pkt: &Packet) -> Decision {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let policy = self.active.load();

        let zone = match self.resolve_zone(&policy, pkt) {
            Some(zone) => zone,
            None => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("flywall_decisions_unknown_zone_total").increment(1);
                return Decision::drop(RULE_UNKNOWN_ZONE);
            }
        };

        for block in policy.by_zone.get(zone).into_iter().flatten() {
            for rule in &block.rules {
                if rule_matches(rule, pkt) {
                    trace!(rule = %rule.rule_id, "first match");
                    if rule.action == RuleAction::Drop || rule.action == RuleAction::Reject {
                        self.drops.fetch_add(1, Ordering::Relaxed);
                    }
                    return Decision {
                        action: rule.action,
                        rule_id: rule.rule_id.clone(),
                    };
                }
            }
        }

        self.drops.fetch_add(1, Ordering::Relaxed);
        Decision::drop(RULE_DEFAULT_DROP)
    }

    fn resolve_zone<'a>(&self, policy: &'a CompiledPolicy, pkt: &Packet) -> Option<&'a str> {
        if let Some(zone) = policy.zone_for_iface(&pkt.in_iface) {
            return Some(zone);
        }
        // Hairpin and broadcast/multicast resolve by interface only.
        if pkt.is_hairpin() || pkt.is_broadcast_or_multicast() {
            return None;
        }
        policy.zone_for_ip(pkt.src_ip)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    pub lookups: u64,
    pub drops: u64,
}

fn rule_matches(rule: &CompiledRule, pkt: &Packet) -> bool {
    if let Some(p) = rule.proto {
        if p != pkt.proto {
            return false;
        }
    }
    if let Some(m) = &rule.src {
        if m.matches(pkt.src_ip) == rule.invert_src {
            return false;
        }
    }
    if let Some(m) = &rule.dst {
        if m.matches(pkt.dst_ip) == rule.invert_dst {
            return false;
        }
    }
    if !rule.src_ports.is_empty() && !rule.src_ports.contains(&pkt.src_port) {
        return false;
    }
    if !rule.dst_ports.is_empty() && !rule.dst_ports.contains(&pkt.dst_port) {
        return false;
    }
    if let Some(iface) = &rule.in_iface {
        if iface != &pkt.in_iface {
            return false;
        }
    }
    if let Some(iface) = &rule.out_iface {
        if pkt.out_iface.as_deref() != Some(iface.as_str()) {
            return false;
        }
    }
    true
}
