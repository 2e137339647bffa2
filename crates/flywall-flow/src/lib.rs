//! Shared flow table
//!
//! Keyed 5-tuple map shared between the kernel fast path and the
//! userspace controller. Lookups are O(1) expected; per-key writes go
//! through the atomics on [`FlowState`]. Capacity is bounded; when the
//! table is full the entry idle the longest is evicted and the
//! controller is notified through the eviction callback.

#![warn(clippy::all)]

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use flywall_common::{FlowKey, FlowSnapshot, FlowState};
use parking_lot::RwLock;
use tracing::{debug, trace};

/// Default capacity bound.
pub const DEFAULT_CAPACITY: usize = 100_000;

/// Invoked with the evicted key and its final state.
pub type EvictionCallback = Box<dyn Fn(&FlowKey, FlowSnapshot) + Send + Sync>;

/// Bounded, concurrently shared flow map with a reverse IP index.
pub struct FlowTable {
    entries: DashMap<FlowKey, Arc<FlowState>>,
    /// IP string → keys touching that address, for O(1) "IP is taken"
    /// queries by higher-level allocators.
    by_ip: DashMap<String, HashSet<FlowKey>>,
    capacity: usize,
    on_evict: RwLock<Option<EvictionCallback>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            by_ip: DashMap::new(),
            capacity: capacity.max(1),
            on_evict: RwLock::new(None),
        }
    }

    /// Register the controller's eviction callback.
    pub fn set_eviction_callback(&self, cb: EvictionCallback) {
        *self.on_evict.write() = Some(cb);
    }

    #[inline]
    pub fn get(&self, key: &FlowKey) -> Option<Arc<FlowState>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Fetch or create the state for a key.
    ///
    /// Creation may evict the longest-idle entry when the table is at
    /// capacity.
    pub fn upsert(&self, key: FlowKey, now_ns: u64, ttl_ns: u64) -> Arc<FlowState> {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        let state = self
            .entries
            .entry(key)
            .or_insert_with(|| {
                trace!(?key, "flow created");
                self.index_ip(&key);
                Arc::new(FlowState::new(now_ns, ttl_ns))
            })
            .value()
            .clone();
        metrics::gauge!("flywall_flow_table_entries").set(self.entries.len() as f64);
        state
    }

    /// Remove a flow outright. Returns its final state if present.
    pub fn remove(&self, key: &FlowKey) -> Option<FlowSnapshot> {
        let (key, state) = self.entries.remove(key)?;
        self.unindex_ip(&key);
        Some(state.snapshot())
    }

    /// Remove every entry whose `last_seen` is older than the cutoff.
    ///
    /// All stale entries go in one sweep; the removed keys are returned
    /// so the caller can reconcile kernel state.
    pub fn expire_before(&self, cutoff_ns: u64) -> Vec<FlowKey> {
        let stale: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|e| e.value().last_seen_ns() < cutoff_ns)
            .map(|e| *e.key())
            .collect();
        for key in &stale {
            if self.entries.remove(key).is_some() {
                self.unindex_ip(key);
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "expired idle flows");
            metrics::counter!("flywall_flow_expired_total").increment(stale.len() as u64);
        }
        stale
    }

    /// Whether any tracked flow touches the address.
    pub fn ip_taken(&self, ip: &str) -> bool {
        self.by_ip
            .get(ip)
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }

    /// Keys currently associated with an address.
    pub fn keys_for_ip(&self, ip: &str) -> Vec<FlowKey> {
        self.by_ip
            .get(ip)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Point-in-time listing of all flows.
    pub fn snapshot(&self) -> Vec<(FlowKey, FlowSnapshot)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().snapshot()))
            .collect()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_seen_ns())
            .map(|e| *e.key());
        let Some(key) = oldest else { return };
        if let Some((key, state)) = self.entries.remove(&key) {
            self.unindex_ip(&key);
            let snapshot = state.snapshot();
            debug!(?key, "flow evicted at capacity");
            metrics::counter!("flywall_flow_evicted_total").increment(1);
            if let Some(cb) = self.on_evict.read().as_ref() {
                cb(&key, snapshot);
            }
        }
    }

    fn index_ip(&self, key: &FlowKey) {
        self.by_ip
            .entry(key.src_ip.to_string())
            .or_default()
            .insert(*key);
        self.by_ip
            .entry(key.dst_ip.to_string())
            .or_default()
            .insert(*key);
    }

    fn unindex_ip(&self, key: &FlowKey) {
        for ip in [key.src_ip.to_string(), key.dst_ip.to_string()] {
            let mut empty = false;
            if let Some(mut keys) = self.by_ip.get_mut(&ip) {
                keys.remove(key);
                empty = keys.is_empty();
            }
            if empty {
                self.by_ip.remove_if(&ip, |_, keys| keys.is_empty());
            }
        }
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flywall_common::proto;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(last_octet: u8, port: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last_octet)),
            "1.1.1.1".parse().unwrap(),
            port,
            443,
            proto::TCP,
            1,
        )
    }

    #[test]
    fn upsert_then_get() {
        let table = FlowTable::new();
        let k = key(1, 40000);
        let state = table.upsert(k, 100, 1_000);
        state.record_packet(64, 100, 1_000);
        let again = table.get(&k).unwrap();
        assert_eq!(again.packets(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn capacity_eviction_notifies_controller() {
        let table = FlowTable::with_capacity(2);
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        table.set_eviction_callback(Box::new(move |_key, _snap| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        // Oldest by last_seen is the first inserted.
        table.upsert(key(1, 1), 100, 10_000).record_packet(1, 100, 10_000);
        table.upsert(key(2, 2), 200, 10_000).record_packet(1, 200, 10_000);
        table.upsert(key(3, 3), 300, 10_000);

        assert_eq!(table.len(), 2);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        assert!(table.get(&key(1, 1)).is_none());
        assert!(table.get(&key(3, 3)).is_some());
    }

    #[test]
    fn expire_removes_all_stale_entries() {
        let table = FlowTable::new();
        for i in 0..5u8 {
            let state = table.upsert(key(i, i as u16 + 1), 0, u64::MAX);
            state.record_packet(1, (i as u64) * 100, u64::MAX);
        }
        // Entries with last_seen 0,100,200 are stale at cutoff 250.
        let removed = table.expire_before(250);
        assert_eq!(removed.len(), 3);
        assert_eq!(table.len(), 2);
        // Nothing stale remains.
        assert!(table.expire_before(250).is_empty());
    }

    #[test]
    fn reverse_index_tracks_addresses() {
        let table = FlowTable::new();
        let k = key(7, 1234);
        table.upsert(k, 0, 1_000);
        assert!(table.ip_taken("10.0.0.7"));
        assert!(table.ip_taken("1.1.1.1"));
        assert!(!table.ip_taken("10.0.0.8"));
        assert_eq!(table.keys_for_ip("10.0.0.7"), vec![k]);

        table.remove(&k);
        assert!(!table.ip_taken("10.0.0.7"));
        assert!(!table.ip_taken("1.1.1.1"));
    }

    #[test]
    fn upsert_is_idempotent_per_key() {
        let table = FlowTable::new();
        let k = key(1, 1);
        let a = table.upsert(k, 0, 1_000);
        let b = table.upsert(k, 50, 1_000);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }
}
