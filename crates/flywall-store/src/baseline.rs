//! Counter/baseline bridge
//!
//! External metrics collectors read live kernel counters that reset on
//! every restart. The bridge persists baselines in the state store so
//! collectors can present cumulative counts: on startup the baseline is
//! added to the live value, and a live value running backwards means
//! the kernel counter reset, so the previous reading is folded into the
//! baseline and the current value counts from zero.

use std::sync::Arc;

use flywall_common::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::StateStore;

/// Bucket for interface rx/tx baselines.
pub const BUCKET_INTERFACE: &str = "metrics_interface_baseline";
/// Bucket for per-policy packet/byte baselines.
pub const BUCKET_POLICY: &str = "metrics_policy_baseline";

/// Saved interface counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceBaseline {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Saved policy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBaseline {
    pub packets: u64,
    pub bytes: u64,
}

/// One reset-aware cumulative counter.
///
/// `observe` returns the cumulative total for a live reading. When the
/// live value is lower than the previous one the kernel counter reset:
/// the previous reading joins the baseline and the current value is the
/// new delta from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeCounter {
    pub baseline: u64,
    pub last: u64,
}

impl CumulativeCounter {
    pub fn observe(&mut self, current: u64) -> u64 {
        if current < self.last {
            self.baseline += self.last;
        }
        self.last = current;
        self.baseline + current
    }

    pub fn total(&self) -> u64 {
        self.baseline + self.last
    }
}

/// Tiny KV adapter exposed to external metrics collectors.
pub struct BaselineBridge {
    store: Arc<StateStore>,
}

impl BaselineBridge {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn save_interface(&self, iface: &str, baseline: &InterfaceBaseline) -> Result<()> {
        let value = serde_json::to_string(baseline)?;
        self.store.put(BUCKET_INTERFACE, iface, &value)?;
        debug!(iface, ?baseline, "interface baseline saved");
        Ok(())
    }

    pub fn load_interface(&self, iface: &str) -> Result<Option<InterfaceBaseline>> {
        match self.store.get(BUCKET_INTERFACE, iface) {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    pub fn save_policy(&self, policy: &str, baseline: &PolicyBaseline) -> Result<()> {
        let value = serde_json::to_string(baseline)?;
        self.store.put(BUCKET_POLICY, policy, &value)?;
        debug!(policy, ?baseline, "policy baseline saved");
        Ok(())
    }

    pub fn load_policy(&self, policy: &str) -> Result<Option<PolicyBaseline>> {
        match self.store.get(BUCKET_POLICY, policy) {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flywall_common::Platform;

    fn bridge() -> BaselineBridge {
        let (platform, _clock) = Platform::test("baseline-test");
        BaselineBridge::new(Arc::new(StateStore::open_in_memory(platform.clock).unwrap()))
    }

    #[test]
    fn interface_baseline_round_trip() {
        let b = bridge();
        assert!(b.load_interface("eth0").unwrap().is_none());
        let baseline = InterfaceBaseline {
            rx_bytes: 1_000,
            tx_bytes: 2_000,
        };
        b.save_interface("eth0", &baseline).unwrap();
        assert_eq!(b.load_interface("eth0").unwrap().unwrap(), baseline);
    }

    #[test]
    fn policy_baseline_round_trip() {
        let b = bridge();
        let baseline = PolicyBaseline {
            packets: 42,
            bytes: 4_200,
        };
        b.save_policy("policy-lan-to-wan", &baseline).unwrap();
        assert_eq!(
            b.load_policy("policy-lan-to-wan").unwrap().unwrap(),
            baseline
        );
    }

    #[test]
    fn cumulative_counter_survives_reset() {
        let mut counter = CumulativeCounter::default();
        assert_eq!(counter.observe(100), 100);
        assert_eq!(counter.observe(250), 250);
        // Kernel counter reset: current < previous.
        assert_eq!(counter.observe(30), 280);
        assert_eq!(counter.observe(80), 330);
        assert_eq!(counter.total(), 330);
    }
}
