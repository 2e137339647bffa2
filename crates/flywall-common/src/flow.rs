//! Flow identity and per-flow state
//!
//! The flow table is shared between the kernel fast path and the
//! userspace controller. Ownership of fields is split: the fast path
//! writes counters and `last_seen` via fetch-add, userspace writes the
//! verdict and flags via compare-exchange. Nothing else may touch the
//! other side's fields.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// IP protocol numbers the core cares about.
pub mod proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;

    /// Case-insensitive protocol name to number.
    pub fn from_name(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "icmp" => Some(ICMP),
            "tcp" => Some(TCP),
            "udp" => Some(UDP),
            "icmpv6" | "ipv6-icmp" => Some(ICMPV6),
            _ => None,
        }
    }

    pub fn name(proto: u8) -> &'static str {
        match proto {
            ICMP => "icmp",
            TCP => "tcp",
            UDP => "udp",
            ICMPV6 => "icmpv6",
            _ => "other",
        }
    }
}

/// 5-tuple plus ingress interface, canonical in packet direction.
///
/// Port fields are zero for non-L4 protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub ifindex: u32,
}

impl FlowKey {
    pub fn new(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        proto: u8,
        ifindex: u32,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
            ifindex,
        }
    }

    /// Reply-direction key.
    #[inline]
    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
            ifindex: self.ifindex,
        }
    }

    /// Stable flow id: FNV-1a over the tuple fields.
    pub fn flow_id(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        let mut eat = |bytes: &[u8]| {
            for &b in bytes {
                h ^= b as u64;
                h = h.wrapping_mul(FNV_PRIME);
            }
        };
        match self.src_ip {
            IpAddr::V4(ip) => eat(&ip.octets()),
            IpAddr::V6(ip) => eat(&ip.octets()),
        }
        match self.dst_ip {
            IpAddr::V4(ip) => eat(&ip.octets()),
            IpAddr::V6(ip) => eat(&ip.octets()),
        }
        eat(&self.src_port.to_be_bytes());
        eat(&self.dst_port.to_be_bytes());
        eat(&[self.proto]);
        eat(&self.ifindex.to_be_bytes());
        h
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            proto: 0,
            ifindex: 0,
        }
    }
}

/// Userspace decision for a flow.
///
/// Transitions are one-way: `Unknown` may become `Trusted` or `Drop`,
/// never back, and `Trusted` and `Drop` never swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Verdict {
    Unknown = 0,
    Trusted = 1,
    Drop = 2,
}

impl Verdict {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Verdict::Trusted,
            2 => Verdict::Drop,
            _ => Verdict::Unknown,
        }
    }
}

/// Per-flow flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FlowFlags(pub u32);

impl FlowFlags {
    /// Flow is promoted to the kernel bypass; implies `Trusted`.
    pub const OFFLOADED: u32 = 1 << 0;
    /// Payload inspection ran at least once.
    pub const INSPECTED: u32 = 1 << 1;

    #[inline]
    pub const fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Tracked connection state, as the conntrack view reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    New,
    Established,
    Closed,
}

/// Cold per-flow data, written rarely.
#[derive(Debug, Default, Clone)]
struct FlowCold {
    fingerprint: Option<[u8; 16]>,
    sni: Option<String>,
}

/// Maximum stored SNI length in bytes.
pub const SNI_MAX: usize = 64;

/// Shared mutable flow state.
///
/// Counters only grow while the flow lives; `last_seen` never moves
/// backwards.
#[derive(Debug)]
pub struct FlowState {
    verdict: AtomicU8,
    flags: AtomicU32,
    qos_profile_id: AtomicU32,
    packets: AtomicU64,
    bytes: AtomicU64,
    first_seen_ns: u64,
    last_seen_ns: AtomicU64,
    expires_at_ns: AtomicU64,
    cold: RwLock<FlowCold>,
}

impl FlowState {
    pub fn new(now_ns: u64, ttl_ns: u64) -> Self {
        Self {
            verdict: AtomicU8::new(Verdict::Unknown as u8),
            flags: AtomicU32::new(0),
            qos_profile_id: AtomicU32::new(0),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            first_seen_ns: now_ns,
            last_seen_ns: AtomicU64::new(now_ns),
            expires_at_ns: AtomicU64::new(now_ns.saturating_add(ttl_ns)),
            cold: RwLock::new(FlowCold::default()),
        }
    }

    /// Fast-path packet accounting. Counters fetch-add; `last_seen`
    /// advances monotonically.
    #[inline]
    pub fn record_packet(&self, len: u64, now_ns: u64, ttl_ns: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
        self.last_seen_ns.fetch_max(now_ns, Ordering::Relaxed);
        self.expires_at_ns
            .fetch_max(now_ns.saturating_add(ttl_ns), Ordering::Relaxed);
    }

    /// One-way verdict transition out of `Unknown`.
    ///
    /// Returns the verdict that actually holds afterwards; `Err` carries
    /// the existing terminal verdict when the transition lost the race
    /// or was illegal.
    pub fn try_set_verdict(&self, to: Verdict) -> std::result::Result<Verdict, Verdict> {
        if to == Verdict::Unknown {
            return Err(self.verdict());
        }
        match self.verdict.compare_exchange(
            Verdict::Unknown as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(to),
            Err(cur) => {
                let cur = Verdict::from_u8(cur);
                if cur == to {
                    Ok(cur)
                } else {
                    Err(cur)
                }
            }
        }
    }

    /// Raise the offloaded flag. Only meaningful on a trusted flow; the
    /// flag is refused otherwise so `OFFLOADED ⇒ Trusted` always holds.
    pub fn set_offloaded(&self) -> bool {
        if self.verdict() != Verdict::Trusted {
            return false;
        }
        self.flags.fetch_or(FlowFlags::OFFLOADED, Ordering::AcqRel);
        true
    }

    pub fn set_flag(&self, flag: u32) {
        if flag == FlowFlags::OFFLOADED {
            self.set_offloaded();
            return;
        }
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn set_qos_profile(&self, id: u32) {
        self.qos_profile_id.store(id, Ordering::Relaxed);
    }

    pub fn set_fingerprint(&self, fp: [u8; 16]) {
        self.cold.write().fingerprint = Some(fp);
    }

    /// Store the SNI, truncated to [`SNI_MAX`] bytes on a char boundary.
    pub fn set_sni(&self, sni: &str) {
        let mut end = sni.len().min(SNI_MAX);
        while !sni.is_char_boundary(end) {
            end -= 1;
        }
        self.cold.write().sni = Some(sni[..end].to_string());
    }

    #[inline]
    pub fn verdict(&self) -> Verdict {
        Verdict::from_u8(self.verdict.load(Ordering::Acquire))
    }

    #[inline]
    pub fn flags(&self) -> FlowFlags {
        FlowFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn first_seen_ns(&self) -> u64 {
        self.first_seen_ns
    }

    #[inline]
    pub fn last_seen_ns(&self) -> u64 {
        self.last_seen_ns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn expires_at_ns(&self) -> u64 {
        self.expires_at_ns.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now_ns: u64) -> bool {
        now_ns > self.expires_at_ns()
    }

    /// Consistent point-in-time copy.
    pub fn snapshot(&self) -> FlowSnapshot {
        let cold = self.cold.read().clone();
        FlowSnapshot {
            verdict: self.verdict(),
            flags: self.flags(),
            qos_profile_id: self.qos_profile_id.load(Ordering::Relaxed),
            packets: self.packets(),
            bytes: self.bytes(),
            first_seen_ns: self.first_seen_ns,
            last_seen_ns: self.last_seen_ns(),
            expires_at_ns: self.expires_at_ns(),
            fingerprint: cold.fingerprint,
            sni: cold.sni,
        }
    }
}

/// Plain copy of a [`FlowState`] at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub verdict: Verdict,
    pub flags: FlowFlags,
    pub qos_profile_id: u32,
    pub packets: u64,
    pub bytes: u64,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    pub expires_at_ns: u64,
    pub fingerprint: Option<[u8; 16]>,
    pub sni: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey::new(
            "192.168.1.10".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            40000,
            443,
            proto::TCP,
            2,
        )
    }

    #[test]
    fn reverse_swaps_endpoints() {
        let k = key();
        let r = k.reverse();
        assert_eq!(r.src_ip, k.dst_ip);
        assert_eq!(r.dst_port, k.src_port);
        assert_eq!(r.reverse(), k);
    }

    #[test]
    fn flow_id_is_stable_and_discriminating() {
        let a = key();
        let b = key();
        assert_eq!(a.flow_id(), b.flow_id());
        let mut c = key();
        c.src_port = 40001;
        assert_ne!(a.flow_id(), c.flow_id());
    }

    #[test]
    fn verdict_transitions_are_one_way() {
        let state = FlowState::new(0, 1_000);
        assert_eq!(state.verdict(), Verdict::Unknown);
        assert_eq!(state.try_set_verdict(Verdict::Trusted), Ok(Verdict::Trusted));
        // Repeating the same terminal verdict is fine.
        assert_eq!(state.try_set_verdict(Verdict::Trusted), Ok(Verdict::Trusted));
        // Trusted never becomes Drop.
        assert_eq!(state.try_set_verdict(Verdict::Drop), Err(Verdict::Trusted));
        assert_eq!(state.verdict(), Verdict::Trusted);
    }

    #[test]
    fn offloaded_requires_trusted() {
        let state = FlowState::new(0, 1_000);
        assert!(!state.set_offloaded());
        assert!(!state.flags().has(FlowFlags::OFFLOADED));
        state.try_set_verdict(Verdict::Trusted).unwrap();
        assert!(state.set_offloaded());
        assert!(state.flags().has(FlowFlags::OFFLOADED));
    }

    #[test]
    fn counters_are_monotonic() {
        let state = FlowState::new(100, 1_000);
        state.record_packet(1500, 200, 1_000);
        state.record_packet(40, 150, 1_000); // out-of-order timestamp
        assert_eq!(state.packets(), 2);
        assert_eq!(state.bytes(), 1540);
        // last_seen keeps the max, never regresses
        assert_eq!(state.last_seen_ns(), 200);
        assert!(state.last_seen_ns() >= state.first_seen_ns());
    }

    #[test]
    fn sni_is_bounded() {
        let state = FlowState::new(0, 1_000);
        let long = "a".repeat(200);
        state.set_sni(&long);
        assert_eq!(state.snapshot().sni.unwrap().len(), SNI_MAX);
    }
}
