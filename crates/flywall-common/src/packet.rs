//! Packet record handed to the decision engine and the simulator

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::flow::{proto, FlowKey};

/// TCP header flag bits, as the simulator consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;

    #[inline]
    pub const fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// One parsed packet. Built by the queue/mirror glue from packet
/// headers; the core never touches raw frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Zero for non-L4 protocols.
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub in_iface: String,
    pub out_iface: Option<String>,
    pub ifindex: u32,
    pub len: u32,
    #[serde(default)]
    pub tcp_flags: TcpFlags,
}

impl Packet {
    /// Canonical (ingress-direction) flow key.
    pub fn flow_key(&self) -> FlowKey {
        let (sp, dp) = if self.proto == proto::TCP || self.proto == proto::UDP {
            (self.src_port, self.dst_port)
        } else {
            // Unknown L4 keys the ports to zero.
            (0, 0)
        };
        FlowKey::new(self.src_ip, self.dst_ip, sp, dp, self.proto, self.ifindex)
    }

    /// Broadcast or multicast destination; such packets resolve zones by
    /// ingress interface only.
    pub fn is_broadcast_or_multicast(&self) -> bool {
        match self.dst_ip {
            IpAddr::V4(ip) => ip.is_broadcast() || ip.is_multicast(),
            IpAddr::V6(ip) => ip.is_multicast(),
        }
    }

    /// Hairpin packets also skip address-based zone resolution.
    pub fn is_hairpin(&self) -> bool {
        self.src_ip == self.dst_ip
    }
}

/// Convenience builder used heavily by tests and the simulator.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    pkt: Packet,
}

impl PacketBuilder {
    pub fn tcp(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            pkt: Packet {
                src_ip: src,
                dst_ip: dst,
                src_port,
                dst_port,
                proto: proto::TCP,
                in_iface: String::new(),
                out_iface: None,
                ifindex: 0,
                len: 64,
                tcp_flags: TcpFlags(TcpFlags::SYN),
            },
        }
    }

    pub fn udp(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16) -> Self {
        Self {
            pkt: Packet {
                src_ip: src,
                dst_ip: dst,
                src_port,
                dst_port,
                proto: proto::UDP,
                in_iface: String::new(),
                out_iface: None,
                ifindex: 0,
                len: 64,
                tcp_flags: TcpFlags::default(),
            },
        }
    }

    pub fn icmp(src: IpAddr, dst: IpAddr) -> Self {
        Self {
            pkt: Packet {
                src_ip: src,
                dst_ip: dst,
                src_port: 0,
                dst_port: 0,
                proto: proto::ICMP,
                in_iface: String::new(),
                out_iface: None,
                ifindex: 0,
                len: 64,
                tcp_flags: TcpFlags::default(),
            },
        }
    }

    pub fn iface(mut self, name: &str, ifindex: u32) -> Self {
        self.pkt.in_iface = name.to_string();
        self.pkt.ifindex = ifindex;
        self
    }

    pub fn out_iface(mut self, name: &str) -> Self {
        self.pkt.out_iface = Some(name.to_string());
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.pkt.tcp_flags = TcpFlags(flags);
        self
    }

    pub fn len(mut self, len: u32) -> Self {
        self.pkt.len = len;
        self
    }

    pub fn build(self) -> Packet {
        self.pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_l4_ports_key_to_zero() {
        let pkt = PacketBuilder::icmp("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap())
            .iface("lan0", 3)
            .build();
        let key = pkt.flow_key();
        assert_eq!(key.src_port, 0);
        assert_eq!(key.dst_port, 0);
        assert_eq!(key.ifindex, 3);
    }

    #[test]
    fn broadcast_detection() {
        let pkt = PacketBuilder::udp(
            "192.168.1.5".parse().unwrap(),
            "255.255.255.255".parse().unwrap(),
            68,
            67,
        )
        .build();
        assert!(pkt.is_broadcast_or_multicast());
    }

    #[test]
    fn hairpin_detection() {
        let ip: IpAddr = "10.1.1.1".parse().unwrap();
        let pkt = PacketBuilder::tcp(ip, ip, 1, 2).build();
        assert!(pkt.is_hairpin());
    }
}
