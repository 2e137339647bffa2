//! Pipeline execution and commit scenarios against the simulated kernel

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flywall_common::{
    Config, Error, Kind, PacketBuilder, Platform, PolicyConfig, RuleAction, RuleConfig, Shutdown,
    ZoneConfig,
};
use flywall_kernel::SimKernel;
use flywall_pipeline::{
    export_running, spawn_reload_listener, Applier, ConfigPipeline, ExitStatus, Service, Stage,
    StageOutcome, Supervisor,
};
use flywall_policy::DecisionEngine;
use flywall_store::StateStore;

fn rule(name: &str, action: RuleAction) -> RuleConfig {
    RuleConfig {
        name: name.into(),
        proto: None,
        src: None,
        dst: None,
        src_ports: vec![],
        dst_ports: vec![],
        in_iface: None,
        out_iface: None,
        invert_src: false,
        invert_dst: false,
        action,
    }
}

fn lan_wan_config() -> Config {
    Config {
        zones: vec![
            ZoneConfig {
                name: "lan".into(),
                interfaces: vec!["eth1".into()],
                cidrs: vec!["192.168.1.0/24".into()],
            },
            ZoneConfig {
                name: "wan".into(),
                interfaces: vec!["eth0".into()],
                cidrs: vec![],
            },
        ],
        policies: vec![PolicyConfig {
            name: "lan-out".into(),
            from_zone: "lan".into(),
            to_zone: Some("wan".into()),
            rules: vec![rule("allow-lan", RuleAction::Accept)],
        }],
        ..Default::default()
    }
}

struct Harness {
    platform: Platform,
    kernel: Arc<SimKernel>,
    engine: Arc<DecisionEngine>,
    store: Arc<StateStore>,
    pipeline: ConfigPipeline,
    applier: Arc<Applier>,
    shutdown: Shutdown,
}

fn harness() -> Harness {
    let (platform, _clock) = Platform::test("pipeline-test");
    let kernel = Arc::new(SimKernel::new(platform.clock.clone()));
    let engine = Arc::new(DecisionEngine::new());
    let store = Arc::new(StateStore::open_in_memory(platform.clock.clone()).unwrap());
    let pipeline = ConfigPipeline::standard(platform.clone());
    let applier = Arc::new(Applier::new(kernel.clone(), engine.clone(), store.clone()));
    Harness {
        platform,
        kernel,
        engine,
        store,
        pipeline,
        applier,
        shutdown: Shutdown::new(),
    }
}

#[test]
fn accepted_config_compiles_and_commits() {
    let h = harness();
    let (ctx, report) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    assert!(report.ok());
    assert_eq!(report.stages.len(), 8);

    let apply = h.applier.commit(&ctx).unwrap();
    assert!(apply.config_changes > 0);

    // Kernel got the ruleset.
    let active = h.kernel.active_ruleset().unwrap();
    assert!(active.chain("policy-lan-to-wan").is_some());

    // Engine now accepts lan traffic.
    let pkt = PacketBuilder::tcp(
        "192.168.1.5".parse().unwrap(),
        "1.1.1.1".parse().unwrap(),
        40000,
        443,
    )
    .iface("eth1", 1)
    .build();
    assert_eq!(h.engine.decide(&pkt).action, RuleAction::Accept);
}

#[test]
fn validation_failure_names_the_stage_and_field() {
    let h = harness();
    let mut cfg = lan_wan_config();
    cfg.zones[0].cidrs.push("not-a-cidr".into());
    let err = h.pipeline.execute(cfg, &h.shutdown.handle()).unwrap_err();
    assert_eq!(err.kind(), Kind::Validation);
    assert_eq!(err.attr("stage"), Some("deep"));
    assert_eq!(err.attr("field"), Some("zones[0].cidrs[1]"));
}

#[test]
fn duplicate_zone_pair_fails_dependency_analysis() {
    let h = harness();
    let mut cfg = lan_wan_config();
    let mut dup = cfg.policies[0].clone();
    dup.name = "lan-out-2".into();
    cfg.policies.push(dup);
    let err = h.pipeline.execute(cfg, &h.shutdown.handle()).unwrap_err();
    assert_eq!(err.attr("stage"), Some("dependency"));
}

#[test]
fn optional_stage_failure_is_a_warning() {
    let (platform, _clock) = Platform::test("optional-test");
    let stages = vec![
        Stage::validator("syntax", Box::new(|_| Ok(()))),
        Stage::transformer(
            "flaky-transform",
            Box::new(|ctx| {
                // A failing optional transformer must not leak its edits.
                ctx.candidate.zones.clear();
                Err(Error::unavailable("transformer dependency down"))
            }),
        )
        .optional(),
        Stage::validator(
            "check-untouched",
            Box::new(|ctx| {
                if ctx.candidate.zones.is_empty() {
                    return Err(Error::internal("optional stage leaked changes"));
                }
                Ok(())
            }),
        ),
    ];
    let pipeline = ConfigPipeline::with_stages(platform, stages);
    let shutdown = Shutdown::new();
    let (ctx, report) = pipeline
        .execute(lan_wan_config(), &shutdown.handle())
        .unwrap();
    assert!(report.ok());
    assert_eq!(report.warnings, 1);
    assert_eq!(report.stages[1].outcome, StageOutcome::Warned);
    assert!(!ctx.candidate.zones.is_empty());
}

#[test]
fn compliance_warns_on_unbounded_accept() {
    let h = harness();
    let (_, report) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    // "allow-lan" matches everything unconditionally.
    let compliance = report
        .stages
        .iter()
        .find(|s| s.name == "compliance")
        .unwrap();
    assert_eq!(compliance.outcome, StageOutcome::Warned);
    assert!(compliance.warnings[0].contains("allow-lan"));
}

#[test]
fn optimizer_removes_shadowed_rules() {
    let h = harness();
    let mut cfg = lan_wan_config();
    // The unconditional accept shadows everything after it.
    cfg.policies[0]
        .rules
        .push(rule("never-reached", RuleAction::Drop));
    let (ctx, report) = h.pipeline.execute(cfg, &h.shutdown.handle()).unwrap();
    assert_eq!(ctx.candidate.policies[0].rules.len(), 1);
    assert!(report.warnings > 0);
}

#[test]
fn failed_kernel_apply_keeps_prior_ruleset() {
    let h = harness();
    let (ctx, _) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    h.applier.commit(&ctx).unwrap();
    let before = h.kernel.active_ruleset().unwrap();
    let version_before = h.store.current_version();

    // A second config whose kernel apply fails: everything stays put.
    let mut cfg2 = lan_wan_config();
    cfg2.policies[0].rules[0].action = RuleAction::Drop;
    let (ctx2, _) = h.pipeline.execute(cfg2, &h.shutdown.handle()).unwrap();
    h.kernel.fail_next_apply();
    let err = h.applier.commit(&ctx2).unwrap_err();
    assert_eq!(err.kind(), Kind::Unavailable);

    assert_eq!(h.kernel.active_ruleset().unwrap(), before);
    // No diff was written, so nothing replicated.
    assert_eq!(h.store.current_version(), version_before);
    // Engine still accepts under the prior policy.
    let pkt = PacketBuilder::tcp(
        "192.168.1.5".parse().unwrap(),
        "1.1.1.1".parse().unwrap(),
        40000,
        443,
    )
    .iface("eth1", 1)
    .build();
    assert_eq!(h.engine.decide(&pkt).action, RuleAction::Accept);
}

#[test]
fn commit_writes_diff_only_for_changed_sections() {
    let h = harness();
    let (ctx, _) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    let first = h.applier.commit(&ctx).unwrap();
    assert!(first.config_changes >= 3);

    // Re-committing the identical candidate writes nothing.
    let second = h.applier.commit(&ctx).unwrap();
    assert_eq!(second.config_changes, 0);
}

#[test]
fn round_trip_export_matches_committed_candidate() {
    let h = harness();
    let (ctx, _) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    h.applier.commit(&ctx).unwrap();

    let exported = export_running(&h.store).unwrap().unwrap();
    assert_eq!(exported, ctx.candidate);

    // The exported config survives the pipeline unchanged: the
    // optimizer is idempotent.
    let (ctx2, _) = h.pipeline.execute(exported, &h.shutdown.handle()).unwrap();
    assert_eq!(ctx2.candidate, ctx.candidate);
    assert_eq!(ctx2.ruleset, ctx.ruleset);
}

#[test]
fn services_reload_on_commit() {
    struct CountingService {
        reloads: AtomicUsize,
    }
    impl Service for CountingService {
        fn name(&self) -> &str {
            "dhcp"
        }
        fn reload(&self, _config: &Config) -> flywall_common::Result<bool> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    let h = harness();
    let service = Arc::new(CountingService {
        reloads: AtomicUsize::new(0),
    });
    h.applier.register_service(service.clone());

    let (ctx, _) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    let report = h.applier.commit(&ctx).unwrap();
    assert_eq!(service.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(report.restarted_services, vec!["dhcp".to_string()]);
}

#[test]
fn safe_mode_gates_the_pipeline() {
    let h = harness();
    let supervisor = Supervisor::new(h.platform.clone(), h.store.clone());

    // Three forced kills, then start: safe mode.
    for _ in 0..3 {
        supervisor
            .record_exit(ExitStatus::Signal(9), "forced kill")
            .unwrap();
    }
    supervisor.check_boot();

    let gated = ConfigPipeline::standard(h.platform.clone()).gated_by(supervisor.clone());
    let err = gated
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Unavailable);

    // Safe mode still allows booting the management-only config through
    // an ungated pipeline.
    let (ctx, _) = h
        .pipeline
        .execute(Supervisor::safe_mode_config(), &h.shutdown.handle())
        .unwrap();
    h.applier.commit(&ctx).unwrap();

    // Cleared: the gated pipeline runs again.
    supervisor.clear_safe_mode();
    gated
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
}

#[test]
fn cancellation_between_stages() {
    let h = harness();
    h.shutdown.signal();
    let err = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Timeout);
    assert_eq!(err.attr("cancelled"), Some("true"));
}

#[test]
fn deadline_is_enforced_between_stages() {
    let (platform, clock) = Platform::test("deadline-test");
    let clock_for_stage = clock.clone();
    let stages = vec![
        Stage::validator(
            "slow",
            Box::new(move |_| {
                // The stage itself "takes" ten seconds.
                clock_for_stage.advance(Duration::from_secs(10));
                Ok(())
            }),
        ),
        Stage::validator("after", Box::new(|_| Ok(()))),
    ];
    let pipeline = ConfigPipeline::with_stages(platform, stages);
    let shutdown = Shutdown::new();
    let err = pipeline
        .execute_with_timeout(lan_wan_config(), &shutdown.handle(), Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Timeout);
    assert_eq!(err.attr("stage"), Some("after"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_reruns_the_pipeline() {
    let h = harness();
    let (ctx, _) = h
        .pipeline
        .execute(lan_wan_config(), &h.shutdown.handle())
        .unwrap();
    h.applier.commit(&ctx).unwrap();

    // The "on-disk" config now denies lan traffic.
    let mut updated = lan_wan_config();
    updated.policies[0].rules[0].action = RuleAction::Drop;
    let updated_clone = updated.clone();

    let pipeline = Arc::new(ConfigPipeline::standard(h.platform.clone()));
    let (reload, task) = spawn_reload_listener(
        pipeline,
        h.applier.clone(),
        Box::new(move || Ok(updated_clone.clone())),
        h.shutdown.handle(),
    );

    reload.trigger();
    // Wait for the new policy to take effect.
    let pkt = PacketBuilder::tcp(
        "192.168.1.5".parse().unwrap(),
        "1.1.1.1".parse().unwrap(),
        40000,
        443,
    )
    .iface("eth1", 1)
    .build();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.engine.decide(&pkt).action == RuleAction::Drop {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reload did not take effect");

    let exported = export_running(&h.store).unwrap().unwrap();
    assert_eq!(exported.policies[0].rules[0].action, RuleAction::Drop);

    h.shutdown.signal();
    task.await.unwrap();
}
