//! Datapath scenarios: controller wired to the simulated kernel
//!
//! Models the three-tier pipeline end to end. The stateless layer is
//! the simulated kernel; undecided flows go through the userspace
//! controller; flows it promotes carry the bypass mark and stop
//! visiting userspace entirely.

use std::sync::Arc;

use flywall_common::{
    Config, FlowFlags, LearningConfig, Packet, PacketBuilder, Platform, PolicyConfig, RuleAction,
    RuleConfig, Verdict, ZoneConfig,
};
use flywall_flow::FlowTable;
use flywall_kernel::{Kernel, SimKernel};
use flywall_learn::{LearnController, QueueVerdict};
use flywall_policy::{compile, DecisionEngine};

/// Minimal queue glue: the fast path serves flows the controller has
/// already offloaded; everything else is queued to the controller.
struct Datapath {
    kernel: Arc<SimKernel>,
    controller: Arc<LearnController>,
}

/// What happened to one packet.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// Delivered via the in-kernel bypass; userspace never saw it.
    FastPath,
    /// Delivered after a userspace verdict.
    Delivered,
    Dropped,
}

impl Datapath {
    fn send(&self, pkt: &Packet, payload: &[u8]) -> Outcome {
        // Stateless filter: blocked sources never reach conntrack.
        if !self.kernel.inject_packet(pkt) {
            return Outcome::Dropped;
        }
        // Fast path: the bypass mark short-circuits the queue.
        if let Some(state) = self.controller.flow_table().get(&pkt.flow_key()) {
            if state.flags().has(FlowFlags::OFFLOADED) {
                state.record_packet(pkt.len as u64, self.kernel.now(), u64::MAX);
                return Outcome::FastPath;
            }
        }
        match self.controller.handle_packet(pkt, payload) {
            QueueVerdict::Drop => Outcome::Dropped,
            QueueVerdict::Accept | QueueVerdict::AcceptWithMark(_) => Outcome::Delivered,
        }
    }
}

fn accept_all_config() -> Config {
    Config {
        zones: vec![ZoneConfig {
            name: "lan".into(),
            interfaces: vec!["eth1".into()],
            cidrs: vec!["192.168.1.0/24".into()],
        }],
        policies: vec![PolicyConfig {
            name: "lan-out".into(),
            from_zone: "lan".into(),
            to_zone: None,
            rules: vec![RuleConfig {
                name: "allow-all".into(),
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
        learning: LearningConfig {
            inspection_window: 3,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn datapath() -> Datapath {
    let (platform, _clock) = Platform::test("datapath");
    let kernel = Arc::new(SimKernel::new(platform.clock.clone()));
    let config = accept_all_config();
    let engine = Arc::new(DecisionEngine::with_policy(Arc::new(
        compile(&config).unwrap(),
    )));
    let controller = LearnController::new(
        platform,
        Arc::new(FlowTable::new()),
        engine,
        config.learning,
    );
    Datapath { kernel, controller }
}

fn flow_packet() -> Packet {
    PacketBuilder::tcp(
        "192.168.1.5".parse().unwrap(),
        "1.1.1.1".parse().unwrap(),
        40000,
        443,
    )
    .iface("eth1", 1)
    .build()
}

#[test]
fn fourth_packet_bypasses_userspace() {
    let dp = datapath();
    let pkt = flow_packet();

    // Three packets traverse the controller under the default-accept
    // policy with inspection_window = 3.
    assert_eq!(dp.send(&pkt, b""), Outcome::Delivered);
    assert_eq!(dp.send(&pkt, b""), Outcome::Delivered);
    assert_eq!(dp.send(&pkt, b""), Outcome::Delivered);
    assert_eq!(dp.controller.stats().packets, 3);

    let state = dp.controller.flow_table().get(&pkt.flow_key()).unwrap();
    assert_eq!(state.verdict(), Verdict::Trusted);
    assert!(state.flags().has(FlowFlags::OFFLOADED));

    // The fourth packet rides the kernel bypass: fast-path verdict
    // Trusted, and the controller's packet counter does not move.
    assert_eq!(dp.send(&pkt, b""), Outcome::FastPath);
    assert_eq!(dp.controller.stats().packets, 3);
    assert_eq!(dp.controller.stats().offloads, 1);
}

#[test]
fn suspended_controller_fails_open() {
    let dp = datapath();
    let trusted = flow_packet();
    for _ in 0..3 {
        dp.send(&trusted, b"");
    }

    dp.controller.pause();

    // Previously trusted flows keep flowing on the fast path.
    assert_eq!(dp.send(&trusted, b""), Outcome::FastPath);

    // New flows are still delivered, never blackholed.
    let fresh = PacketBuilder::udp(
        "192.168.1.6".parse().unwrap(),
        "9.9.9.9".parse().unwrap(),
        5353,
        53,
    )
    .iface("eth1", 1)
    .build();
    assert_eq!(dp.send(&fresh, b""), Outcome::Delivered);
    assert!(dp.controller.stats().fail_open >= 1);

    // Both flows are tracked by the kernel.
    assert_eq!(dp.kernel.dump_flows().unwrap().len(), 2);
}

#[test]
fn blocked_source_is_stopped_stateless() {
    let dp = datapath();
    dp.kernel.add_block("192.168.1.5".parse().unwrap()).unwrap();
    assert_eq!(dp.send(&flow_packet(), b""), Outcome::Dropped);
    // The controller never saw it.
    assert_eq!(dp.controller.stats().packets, 0);
}

#[test]
fn denied_flow_verdict_is_terminal() {
    let mut config = accept_all_config();
    config.policies[0].rules[0].action = RuleAction::Drop;
    let (platform, _clock) = Platform::test("datapath-deny");
    let kernel = Arc::new(SimKernel::new(platform.clock.clone()));
    let controller = LearnController::new(
        platform,
        Arc::new(FlowTable::new()),
        Arc::new(DecisionEngine::with_policy(Arc::new(
            compile(&config).unwrap(),
        ))),
        config.learning,
    );
    let dp = Datapath { kernel, controller };

    let pkt = flow_packet();
    assert_eq!(dp.send(&pkt, b""), Outcome::Dropped);
    assert_eq!(dp.send(&pkt, b""), Outcome::Dropped);
    let state = dp.controller.flow_table().get(&pkt.flow_key()).unwrap();
    assert_eq!(state.verdict(), Verdict::Drop);
}
