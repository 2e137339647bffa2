//! In-memory kernel simulator
//!
//! Drives a conntrack-equivalent flow table from injected packets with a
//! minimal TCP state machine. Every test scenario in the core runs
//! against this backend; the clock is injected so tests control time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flywall_common::{proto, Clock, Error, Packet, ProtocolState, Result, TcpFlags};
use parking_lot::RwLock;
use tracing::debug;

use crate::conntrack::Flow;
use crate::counter_names;
use crate::ruleset::Ruleset;
use crate::Kernel;

/// Idle timeouts per protocol class.
#[derive(Debug, Clone, Copy)]
pub struct SimTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub other: Duration,
}

impl Default for SimTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(2 * 60 * 60),
            udp: Duration::from_secs(30),
            other: Duration::from_secs(30),
        }
    }
}

/// Simulated kernel datapath.
pub struct SimKernel {
    clock: Arc<dyn Clock>,
    timeouts: SimTimeouts,
    flows: DashMap<u64, Flow>,
    blocklist: DashMap<IpAddr, ()>,
    counters: DashMap<String, u64>,
    applied: RwLock<Option<Ruleset>>,
    fail_next_apply: AtomicBool,
}

impl SimKernel {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_timeouts(clock, SimTimeouts::default())
    }

    pub fn with_timeouts(clock: Arc<dyn Clock>, timeouts: SimTimeouts) -> Self {
        Self {
            clock,
            timeouts,
            flows: DashMap::new(),
            blocklist: DashMap::new(),
            counters: DashMap::new(),
            applied: RwLock::new(None),
            fail_next_apply: AtomicBool::new(false),
        }
    }

    /// Feed one packet through the simulated datapath.
    ///
    /// Returns `false` when the stateless layer dropped it (blocked
    /// source); tracked packets update the flow table and counters.
    pub fn inject_packet(&self, pkt: &Packet) -> bool {
        if self.blocklist.contains_key(&pkt.src_ip) {
            return false;
        }
        let now = self.now();
        self.bump_counters(pkt);

        let key = pkt.flow_key();
        let id = key.flow_id();
        let reverse_id = key.reverse().flow_id();

        // A reply matches the tracked original-direction flow.
        if let Some(mut entry) = self.flows.get_mut(&reverse_id) {
            let flow = entry.value_mut();
            flow.packets += 1;
            flow.bytes += pkt.len as u64;
            flow.last_seen_ns = now;
            flow.state = Self::advance_state(flow.state, pkt, true);
            return true;
        }

        let mut entry = self.flows.entry(id).or_insert_with(|| {
            debug!(flow_id = id, proto = proto::name(pkt.proto), "new simulated flow");
            Flow::new(key, Self::initial_state(pkt), now)
        });
        let flow = entry.value_mut();
        flow.packets += 1;
        flow.bytes += pkt.len as u64;
        flow.last_seen_ns = now;
        flow.state = Self::advance_state(flow.state, pkt, false);
        true
    }

    fn initial_state(pkt: &Packet) -> ProtocolState {
        match pkt.proto {
            // UDP and ICMP count as established after the first packet.
            proto::UDP | proto::ICMP | proto::ICMPV6 => ProtocolState::Established,
            _ => ProtocolState::New,
        }
    }

    fn advance_state(current: ProtocolState, pkt: &Packet, is_reply: bool) -> ProtocolState {
        if pkt.proto != proto::TCP {
            return ProtocolState::Established;
        }
        let flags = pkt.tcp_flags;
        if flags.has(TcpFlags::FIN) || flags.has(TcpFlags::RST) {
            return ProtocolState::Closed;
        }
        match current {
            ProtocolState::New => {
                // SYN+ACK from the responder completes the handshake.
                if is_reply && flags.has(TcpFlags::SYN) && flags.has(TcpFlags::ACK) {
                    ProtocolState::Established
                } else {
                    ProtocolState::New
                }
            }
            other => other,
        }
    }

    fn bump_counters(&self, pkt: &Packet) {
        let name = match pkt.proto {
            proto::TCP => {
                let f = pkt.tcp_flags;
                if f.has(TcpFlags::RST) {
                    Some(counter_names::RST)
                } else if f.has(TcpFlags::FIN) {
                    Some(counter_names::FIN)
                } else if f.has(TcpFlags::SYN) && !f.has(TcpFlags::ACK) {
                    Some(counter_names::SYN)
                } else {
                    None
                }
            }
            proto::UDP => Some(counter_names::UDP),
            proto::ICMP | proto::ICMPV6 => Some(counter_names::ICMP),
            _ => None,
        };
        if let Some(name) = name {
            *self.counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    fn timeout_ns(&self, p: u8) -> u64 {
        let d = match p {
            proto::TCP => self.timeouts.tcp,
            proto::UDP => self.timeouts.udp,
            _ => self.timeouts.other,
        };
        d.as_nanos() as u64
    }

    fn prune_expired(&self) {
        let now = self.now();
        self.flows.retain(|_, flow| {
            let idle = now.saturating_sub(flow.last_seen_ns);
            idle <= self.timeout_ns(flow.key.proto)
        });
    }

    /// Arrange for the next `apply_ruleset` to fail, leaving the prior
    /// ruleset active. Commit-revert tests use this.
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    /// The ruleset currently in effect, if any.
    pub fn active_ruleset(&self) -> Option<Ruleset> {
        self.applied.read().clone()
    }
}

impl Kernel for SimKernel {
    fn dump_flows(&self) -> Result<Vec<Flow>> {
        self.prune_expired();
        Ok(self.flows.iter().map(|e| e.value().clone()).collect())
    }

    fn get_flow(&self, id: u64) -> Result<Option<Flow>> {
        self.prune_expired();
        Ok(self.flows.get(&id).map(|e| e.value().clone()))
    }

    fn kill_flow(&self, id: u64) -> Result<bool> {
        Ok(self.flows.remove(&id).is_some())
    }

    fn add_block(&self, ip: IpAddr) -> Result<()> {
        self.blocklist.insert(ip, ());
        Ok(())
    }

    fn remove_block(&self, ip: IpAddr) -> Result<()> {
        self.blocklist.remove(&ip);
        Ok(())
    }

    fn is_blocked(&self, ip: IpAddr) -> Result<bool> {
        Ok(self.blocklist.contains_key(&ip))
    }

    fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    fn counters(&self) -> Result<HashMap<String, u64>> {
        Ok(self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }

    fn apply_ruleset(&self, ruleset: &Ruleset) -> Result<()> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(Error::unavailable("simulated ruleset apply failure")
                .with_attr("table", &ruleset.table));
        }
        *self.applied.write() = Some(ruleset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flywall_common::{PacketBuilder, Platform};

    fn setup() -> (SimKernel, Arc<flywall_common::TestClock>) {
        let (platform, clock) = Platform::test("sim-test");
        (SimKernel::new(platform.clock.clone()), clock)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn tcp_handshake_reaches_established() {
        let (kernel, _clock) = setup();
        let syn = PacketBuilder::tcp(ip("10.0.0.1"), ip("10.0.0.2"), 40000, 443)
            .iface("lan0", 1)
            .flags(TcpFlags::SYN)
            .build();
        kernel.inject_packet(&syn);
        let id = syn.flow_key().flow_id();
        assert_eq!(
            kernel.get_flow(id).unwrap().unwrap().state,
            ProtocolState::New
        );

        let syn_ack = PacketBuilder::tcp(ip("10.0.0.2"), ip("10.0.0.1"), 443, 40000)
            .iface("lan0", 1)
            .flags(TcpFlags::SYN | TcpFlags::ACK)
            .build();
        kernel.inject_packet(&syn_ack);
        let flow = kernel.get_flow(id).unwrap().unwrap();
        assert_eq!(flow.state, ProtocolState::Established);
        assert_eq!(flow.packets, 2);
    }

    #[test]
    fn fin_and_rst_close_the_flow() {
        let (kernel, _clock) = setup();
        let syn = PacketBuilder::tcp(ip("10.0.0.1"), ip("10.0.0.2"), 40000, 443).build();
        kernel.inject_packet(&syn);
        let fin = PacketBuilder::tcp(ip("10.0.0.1"), ip("10.0.0.2"), 40000, 443)
            .flags(TcpFlags::FIN | TcpFlags::ACK)
            .build();
        kernel.inject_packet(&fin);
        let id = syn.flow_key().flow_id();
        assert_eq!(
            kernel.get_flow(id).unwrap().unwrap().state,
            ProtocolState::Closed
        );
    }

    #[test]
    fn udp_established_after_first_packet() {
        let (kernel, _clock) = setup();
        let pkt = PacketBuilder::udp(ip("10.0.0.1"), ip("8.8.8.8"), 5353, 53).build();
        kernel.inject_packet(&pkt);
        let flow = kernel.get_flow(pkt.flow_key().flow_id()).unwrap().unwrap();
        assert_eq!(flow.state, ProtocolState::Established);
    }

    #[test]
    fn udp_flow_expires_after_timeout() {
        let (kernel, clock) = setup();
        let pkt = PacketBuilder::udp(ip("10.0.0.1"), ip("8.8.8.8"), 5353, 53).build();
        kernel.inject_packet(&pkt);
        assert_eq!(kernel.dump_flows().unwrap().len(), 1);
        clock.advance(Duration::from_secs(31));
        assert!(kernel.dump_flows().unwrap().is_empty());
    }

    #[test]
    fn tcp_survives_udp_timeout_window() {
        let (kernel, clock) = setup();
        let pkt = PacketBuilder::tcp(ip("10.0.0.1"), ip("10.0.0.2"), 1, 2).build();
        kernel.inject_packet(&pkt);
        clock.advance(Duration::from_secs(120));
        assert_eq!(kernel.dump_flows().unwrap().len(), 1);
        clock.advance(Duration::from_secs(2 * 60 * 60));
        assert!(kernel.dump_flows().unwrap().is_empty());
    }

    #[test]
    fn blocked_source_is_not_tracked() {
        let (kernel, _clock) = setup();
        kernel.add_block(ip("10.0.0.1")).unwrap();
        let pkt = PacketBuilder::udp(ip("10.0.0.1"), ip("8.8.8.8"), 1, 2).build();
        assert!(!kernel.inject_packet(&pkt));
        assert!(kernel.dump_flows().unwrap().is_empty());
        kernel.remove_block(ip("10.0.0.1")).unwrap();
        assert!(kernel.inject_packet(&pkt));
    }

    #[test]
    fn counters_follow_packet_kinds() {
        let (kernel, _clock) = setup();
        kernel.inject_packet(&PacketBuilder::tcp(ip("1.1.1.1"), ip("2.2.2.2"), 1, 2).build());
        kernel.inject_packet(
            &PacketBuilder::tcp(ip("1.1.1.1"), ip("2.2.2.2"), 1, 2)
                .flags(TcpFlags::RST)
                .build(),
        );
        kernel.inject_packet(&PacketBuilder::udp(ip("1.1.1.1"), ip("2.2.2.2"), 1, 2).build());
        kernel.inject_packet(&PacketBuilder::icmp(ip("1.1.1.1"), ip("2.2.2.2")).build());
        let counters = kernel.counters().unwrap();
        assert_eq!(counters[counter_names::SYN], 1);
        assert_eq!(counters[counter_names::RST], 1);
        assert_eq!(counters[counter_names::UDP], 1);
        assert_eq!(counters[counter_names::ICMP], 1);
        assert!(!counters.contains_key(counter_names::FIN));
    }

    #[test]
    fn apply_failure_keeps_prior_ruleset() {
        let (kernel, _clock) = setup();
        let mut first = Ruleset::new(0x200000);
        first.add_chain("policy-lan-to-wan", vec!["accept".into()]);
        kernel.apply_ruleset(&first).unwrap();

        let second = Ruleset::new(0x200000);
        kernel.fail_next_apply();
        let err = kernel.apply_ruleset(&second).unwrap_err();
        assert_eq!(err.kind(), flywall_common::Kind::Unavailable);
        assert_eq!(kernel.active_ruleset().unwrap(), first);

        kernel.apply_ruleset(&second).unwrap();
        assert_eq!(kernel.active_ruleset().unwrap(), second);
    }

    #[test]
    fn kill_flow_removes_entry() {
        let (kernel, _clock) = setup();
        let pkt = PacketBuilder::udp(ip("10.0.0.1"), ip("8.8.8.8"), 1, 2).build();
        kernel.inject_packet(&pkt);
        let id = pkt.flow_key().flow_id();
        assert!(kernel.kill_flow(id).unwrap());
        assert!(!kernel.kill_flow(id).unwrap());
        assert!(kernel.get_flow(id).unwrap().is_none());
    }
}
