//! Ruleset rendering
//!
//! Turns an accepted configuration into the datapath artifact: one
//! chain per policy (named `policy-<from>-to-<to>`), the statistics
//! chain, blocklist enforcement and the bypass short-circuit. New flows
//! fall through to the userspace queue with the bypass flag set, so a
//! dead controller fails open instead of blackholing traffic.

use flywall_common::{Config, Result, RuleAction, RuleConfig};
use flywall_kernel::Ruleset;

/// Render the full ruleset for a candidate configuration.
pub fn render_ruleset(config: &Config) -> Result<Ruleset> {
    let mut rs = Ruleset::new(config.learning.offload_mark);

    let mut input = vec![
        // Trusted flows short-circuit the rest of the pipeline.
        format!("meta mark {:#x} accept", config.learning.offload_mark),
        "ip saddr @blocklist drop".to_string(),
        "jump statistics".to_string(),
    ];
    for policy in &config.policies {
        let chain = Ruleset::policy_chain_name(&policy.from_zone, policy.to_zone.as_deref());
        if let Some(zone) = config.zone(&policy.from_zone) {
            for iface in &zone.interfaces {
                input.push(format!("iifname \"{iface}\" jump {chain}"));
            }
        }
    }
    rs.add_chain("input", input);
    rs.chains.push(Ruleset::statistics_chain());

    for policy in &config.policies {
        let chain = Ruleset::policy_chain_name(&policy.from_zone, policy.to_zone.as_deref());
        let mut rules = vec!["ct state established,related accept".to_string()];
        for rule in policy.rules.iter().chain(config.common_rules.iter()) {
            rules.push(render_rule(rule, &policy.name));
        }
        // Undecided traffic goes to the controller; the bypass flag
        // keeps the queue failing open when nothing is listening.
        rules.push("queue flags bypass to 0".to_string());
        rs.add_chain(chain, rules);
    }

    Ok(rs)
}

fn render_rule(rule: &RuleConfig, policy_name: &str) -> String {
    let mut parts = Vec::new();
    if let Some(iface) = &rule.in_iface {
        parts.push(format!("iifname \"{iface}\""));
    }
    if let Some(iface) = &rule.out_iface {
        parts.push(format!("oifname \"{iface}\""));
    }
    if let Some(src) = &rule.src {
        let neg = if rule.invert_src { "!= " } else { "" };
        parts.push(format!("ip saddr {neg}{src}"));
    }
    if let Some(dst) = &rule.dst {
        let neg = if rule.invert_dst { "!= " } else { "" };
        parts.push(format!("ip daddr {neg}{dst}"));
    }
    let proto = rule
        .proto
        .as_deref()
        .map(|p| p.to_ascii_lowercase())
        .unwrap_or_else(|| "ip".to_string());
    if !rule.src_ports.is_empty() {
        parts.push(format!("{proto} sport {}", port_set(&rule.src_ports)));
    }
    if !rule.dst_ports.is_empty() {
        parts.push(format!("{proto} dport {}", port_set(&rule.dst_ports)));
    }
    if rule.src_ports.is_empty() && rule.dst_ports.is_empty() && rule.proto.is_some() {
        parts.push(format!("meta l4proto {proto}"));
    }
    let action = match rule.action {
        RuleAction::Accept => "accept",
        RuleAction::Drop => "drop",
        RuleAction::Reject => "reject",
    };
    parts.push(action.to_string());
    parts.push(format!("comment \"rule:{policy_name}:{}\"", rule.name));
    parts.join(" ")
}

fn port_set(ports: &[u16]) -> String {
    if ports.len() == 1 {
        ports[0].to_string()
    } else {
        let list = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{ {list} }}")
    }
}
