//! Staged pipeline execution
//!
//! Order: syntax → intent → deep → compliance (optional) → dependency →
//! connectivity (optional) → optimize → dry-run. A non-optional failure
//! aborts with the stage name attached; optional failures register
//! warnings and leave the candidate unchanged. Cancellation and the
//! whole-run deadline are honored between stages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use flywall_common::{
    Config, Error, Packet, PacketBuilder, Platform, ReplicationMode, Result, RuleAction,
    ShutdownHandle,
};
use flywall_policy::compile as compile_policy;
use tracing::{debug, info, warn};

use crate::compile::render_ruleset;
use crate::stage::{
    PipelineContext, PipelineReport, Stage, StageOutcome, StageReport,
};
use crate::supervisor::Supervisor;

/// The staged configuration pipeline.
pub struct ConfigPipeline {
    platform: Platform,
    stages: Vec<Stage>,
    /// When present, safe mode disables execution until cleared.
    supervisor: Option<Arc<Supervisor>>,
}

impl ConfigPipeline {
    /// Pipeline with the standard stage set.
    pub fn standard(platform: Platform) -> Self {
        Self {
            platform,
            stages: standard_stages(),
            supervisor: None,
        }
    }

    /// Pipeline with custom stages (tests, reduced safe-mode surface).
    pub fn with_stages(platform: Platform, stages: Vec<Stage>) -> Self {
        Self {
            platform,
            stages,
            supervisor: None,
        }
    }

    /// Attach the supervisor gate.
    pub fn gated_by(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Execute all stages against a candidate.
    pub fn execute(
        &self,
        candidate: Config,
        shutdown: &ShutdownHandle,
    ) -> Result<(PipelineContext, PipelineReport)> {
        self.execute_inner(candidate, shutdown, None)
    }

    /// Execute with a whole-run deadline; the deadline is checked
    /// between stages against the platform clock.
    pub fn execute_with_timeout(
        &self,
        candidate: Config,
        shutdown: &ShutdownHandle,
        timeout: Duration,
    ) -> Result<(PipelineContext, PipelineReport)> {
        let deadline = self.platform.now_ns().saturating_add(timeout.as_nanos() as u64);
        self.execute_inner(candidate, shutdown, Some(deadline))
    }

    fn execute_inner(
        &self,
        candidate: Config,
        shutdown: &ShutdownHandle,
        deadline_ns: Option<u64>,
    ) -> Result<(PipelineContext, PipelineReport)> {
        if let Some(supervisor) = &self.supervisor {
            if supervisor.is_safe_mode() {
                return Err(Error::unavailable(
                    "configuration pipeline disabled in safe mode",
                ));
            }
        }

        let started_ns = self.platform.now_ns();
        let mut ctx = PipelineContext::new(candidate);
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut warnings_total = 0usize;

        for stage in &self.stages {
            if shutdown.is_signalled() {
                return Err(Error::timeout("pipeline cancelled")
                    .with_attr("stage", stage.name)
                    .with_attr("cancelled", true));
            }
            if let Some(deadline) = deadline_ns {
                if self.platform.now_ns() > deadline {
                    return Err(Error::timeout("pipeline deadline exceeded")
                        .with_attr("stage", stage.name));
                }
            }

            let stage_start = self.platform.now_ns();
            let warnings_before = ctx.warnings.len();
            let result = if stage.optional {
                // Optional stages run on a scratch context so a failure
                // leaves the candidate untouched.
                let mut scratch = ctx.clone();
                match stage.run(&mut scratch) {
                    Ok(()) => {
                        ctx = scratch;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            } else {
                stage.run(&mut ctx)
            };
            let duration_ms =
                self.platform.now_ns().saturating_sub(stage_start) / 1_000_000;

            match result {
                Ok(()) => {
                    let new_warnings = ctx.warnings[warnings_before..].to_vec();
                    let outcome = if new_warnings.is_empty() {
                        StageOutcome::Passed
                    } else {
                        StageOutcome::Warned
                    };
                    warnings_total += new_warnings.len();
                    debug!(stage = stage.name, ?outcome, "pipeline stage complete");
                    reports.push(StageReport {
                        name: stage.name.to_string(),
                        outcome,
                        error: None,
                        warnings: new_warnings,
                        duration_ms,
                    });
                }
                Err(e) if stage.optional => {
                    warn!(stage = stage.name, error = %e, "optional stage failed; continuing");
                    warnings_total += 1;
                    reports.push(StageReport {
                        name: stage.name.to_string(),
                        outcome: StageOutcome::Warned,
                        error: None,
                        warnings: vec![format!("{e}")],
                        duration_ms,
                    });
                }
                Err(e) => {
                    warn!(stage = stage.name, error = %e, "pipeline aborted");
                    metrics::counter!("flywall_pipeline_failures_total").increment(1);
                    reports.push(StageReport {
                        name: stage.name.to_string(),
                        outcome: StageOutcome::Failed,
                        error: Some(e.to_string()),
                        warnings: Vec::new(),
                        duration_ms,
                    });
                    return Err(e.with_attr("stage", stage.name));
                }
            }
        }

        let finished_ns = self.platform.now_ns();
        let report = PipelineReport {
            stages: reports,
            errors: 0,
            warnings: warnings_total,
            started_at: DateTime::from_timestamp_nanos(started_ns as i64),
            finished_at: DateTime::from_timestamp_nanos(finished_ns as i64),
        };
        info!(summary = %report.summary(), "pipeline complete");
        Ok((ctx, report))
    }
}

/// The eight standard stages.
pub fn standard_stages() -> Vec<Stage> {
    vec![
        Stage::validator("syntax", Box::new(validate_syntax)),
        Stage::validator("intent", Box::new(validate_intent)),
        Stage::validator("deep", Box::new(validate_deep)),
        Stage::validator("compliance", Box::new(check_compliance)).optional(),
        Stage::validator("dependency", Box::new(analyze_dependencies)),
        Stage::validator("connectivity", Box::new(simulate_connectivity)).optional(),
        Stage::transformer("optimize", Box::new(optimize_rules)),
        Stage::executor("dry_run", Box::new(dry_run)),
    ]
}

fn validate_syntax(ctx: &mut PipelineContext) -> Result<()> {
    let cfg = &ctx.candidate;
    let mut zone_names = HashSet::new();
    for (i, zone) in cfg.zones.iter().enumerate() {
        if zone.name.is_empty() {
            return Err(Error::validation("zone name is empty")
                .with_attr("field", format!("zones[{i}].name")));
        }
        if !zone_names.insert(zone.name.as_str()) {
            return Err(Error::validation("duplicate zone name")
                .with_attr("field", format!("zones[{i}].name"))
                .with_attr("value", &zone.name));
        }
    }
    let mut policy_names = HashSet::new();
    for (pi, policy) in cfg.policies.iter().enumerate() {
        if policy.name.is_empty() {
            return Err(Error::validation("policy name is empty")
                .with_attr("field", format!("policies[{pi}].name")));
        }
        if !policy_names.insert(policy.name.as_str()) {
            return Err(Error::validation("duplicate policy name")
                .with_attr("field", format!("policies[{pi}].name"))
                .with_attr("value", &policy.name));
        }
        let mut rule_names = HashSet::new();
        for (ri, rule) in policy.rules.iter().enumerate() {
            if rule.name.is_empty() {
                return Err(Error::validation("rule name is empty")
                    .with_attr("field", format!("policies[{pi}].rules[{ri}].name")));
            }
            if !rule_names.insert(rule.name.as_str()) {
                return Err(Error::validation("duplicate rule name in policy")
                    .with_attr("field", format!("policies[{pi}].rules[{ri}].name"))
                    .with_attr("value", &rule.name));
            }
        }
    }
    if !(3..=10).contains(&cfg.learning.inspection_window) {
        return Err(Error::validation("inspection window outside 3-10")
            .with_attr("field", "learning.inspection_window")
            .with_attr("value", cfg.learning.inspection_window));
    }
    Ok(())
}

fn validate_intent(ctx: &mut PipelineContext) -> Result<()> {
    let cfg = &ctx.candidate;
    let zones: HashSet<&str> = cfg.zones.iter().map(|z| z.name.as_str()).collect();
    let interfaces: HashSet<&str> = cfg
        .zones
        .iter()
        .flat_map(|z| z.interfaces.iter().map(String::as_str))
        .collect();

    for (pi, policy) in cfg.policies.iter().enumerate() {
        if !zones.contains(policy.from_zone.as_str()) {
            return Err(Error::validation("from_zone is not a declared zone")
                .with_attr("field", format!("policies[{pi}].from_zone"))
                .with_attr("value", &policy.from_zone));
        }
        if let Some(to) = &policy.to_zone {
            if !zones.contains(to.as_str()) {
                return Err(Error::validation("to_zone is not a declared zone")
                    .with_attr("field", format!("policies[{pi}].to_zone"))
                    .with_attr("value", to));
            }
        }
        for (ri, rule) in policy.rules.iter().enumerate() {
            for (field, iface) in [("in_iface", &rule.in_iface), ("out_iface", &rule.out_iface)] {
                if let Some(iface) = iface {
                    if !interfaces.contains(iface.as_str()) {
                        return Err(Error::validation("rule references unknown interface")
                            .with_attr("field", format!("policies[{pi}].rules[{ri}].{field}"))
                            .with_attr("value", iface));
                    }
                }
            }
        }
    }
    if let Some(ha) = &cfg.ha {
        if ha.priority == 0 || ha.priority == 255 {
            return Err(Error::validation("HA priority outside 1-254")
                .with_attr("field", "ha.priority")
                .with_attr("value", ha.priority));
        }
    }
    if let Some(replication) = &cfg.replication {
        if replication.mode == ReplicationMode::Replica && replication.peer_addr.is_none() {
            return Err(Error::validation("replica mode requires a peer address")
                .with_attr("field", "replication.peer_addr"));
        }
    }
    Ok(())
}

fn validate_deep(ctx: &mut PipelineContext) -> Result<()> {
    // Full type-level compilation: every CIDR, address and protocol
    // must parse. The result is discarded; dry-run compiles again after
    // the optimizer has run.
    compile_policy(&ctx.candidate)?;
    if let Some(ha) = &ctx.candidate.ha {
        if ha.vip.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::validation("VIP is not an IP address")
                .with_attr("field", "ha.vip")
                .with_attr("value", &ha.vip));
        }
    }
    Ok(())
}

fn check_compliance(ctx: &mut PipelineContext) -> Result<()> {
    let mut notes = Vec::new();
    for policy in &ctx.candidate.policies {
        if policy.rules.is_empty() {
            notes.push(format!("policy {} has no rules (default drop)", policy.name));
        }
        for rule in &policy.rules {
            let unbounded = rule.src.is_none()
                && rule.dst.is_none()
                && rule.src_ports.is_empty()
                && rule.dst_ports.is_empty()
                && rule.proto.is_none();
            if unbounded && rule.action == RuleAction::Accept {
                notes.push(format!(
                    "rule {}:{} accepts all traffic unconditionally",
                    policy.name, rule.name
                ));
            }
        }
    }
    for note in notes {
        ctx.warn(note);
    }
    Ok(())
}

fn analyze_dependencies(ctx: &mut PipelineContext) -> Result<()> {
    let mut pairs = HashSet::new();
    for (pi, policy) in ctx.candidate.policies.iter().enumerate() {
        let pair = (policy.from_zone.clone(), policy.to_zone.clone());
        if !pairs.insert(pair) {
            return Err(Error::validation("duplicate policy for zone pair")
                .with_attr("field", format!("policies[{pi}]"))
                .with_attr("from", &policy.from_zone)
                .with_attr("to", policy.to_zone.as_deref().unwrap_or("any")));
        }
    }
    let empty_zones: Vec<String> = ctx
        .candidate
        .zones
        .iter()
        .filter(|z| z.interfaces.is_empty() && z.cidrs.is_empty())
        .map(|z| z.name.clone())
        .collect();
    for zone in empty_zones {
        ctx.warn(format!("zone {zone} matches no interfaces or addresses"));
    }
    Ok(())
}

fn simulate_connectivity(ctx: &mut PipelineContext) -> Result<()> {
    // Probe one flow per zone through a candidate engine; a config that
    // cannot accept anything from any zone is suspicious enough to
    // surface (the stage is optional, so this becomes a warning).
    let compiled = Arc::new(compile_policy(&ctx.candidate)?);
    let engine = flywall_policy::DecisionEngine::with_policy(compiled);

    let mut probed = 0usize;
    let mut accepted = 0usize;
    for zone in &ctx.candidate.zones {
        let Some(iface) = zone.interfaces.first() else {
            continue;
        };
        let src = zone
            .cidrs
            .first()
            .and_then(|c| c.split('/').next())
            .and_then(|ip| ip.parse().ok())
            .unwrap_or_else(|| std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 10)));
        let target = std::net::IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 1));
        let probe: Packet = PacketBuilder::tcp(src, target, 40000, 443)
            .iface(iface, 1)
            .build();
        probed += 1;
        if engine.decide(&probe).action == RuleAction::Accept {
            accepted += 1;
        }
    }
    if probed > 0 && accepted == 0 {
        return Err(Error::validation(
            "no zone can originate traffic under the candidate policy",
        ));
    }
    Ok(())
}

fn optimize_rules(ctx: &mut PipelineContext) -> Result<()> {
    let mut removed = 0usize;
    for policy in &mut ctx.candidate.policies {
        let mut seen = HashSet::new();
        let mut terminal_hit = false;
        policy.rules.retain(|rule| {
            if terminal_hit {
                removed += 1;
                return false;
            }
            // Identity modulo the name: a later duplicate can never fire.
            let identity = (
                rule.proto.clone(),
                rule.src.clone(),
                rule.dst.clone(),
                rule.src_ports.clone(),
                rule.dst_ports.clone(),
                rule.in_iface.clone(),
                rule.out_iface.clone(),
                rule.invert_src,
                rule.invert_dst,
            );
            if !seen.insert(identity) {
                removed += 1;
                return false;
            }
            // An unconditional rule shadows everything after it.
            if rule.proto.is_none()
                && rule.src.is_none()
                && rule.dst.is_none()
                && rule.src_ports.is_empty()
                && rule.dst_ports.is_empty()
                && rule.in_iface.is_none()
                && rule.out_iface.is_none()
            {
                terminal_hit = true;
            }
            true
        });
    }
    if removed > 0 {
        ctx.warn(format!("optimizer removed {removed} unreachable rules"));
    }
    Ok(())
}

fn dry_run(ctx: &mut PipelineContext) -> Result<()> {
    let compiled = Arc::new(compile_policy(&ctx.candidate)?);
    let ruleset = render_ruleset(&ctx.candidate)?;
    ctx.compiled = Some(compiled);
    ctx.ruleset = Some(ruleset);
    Ok(())
}
