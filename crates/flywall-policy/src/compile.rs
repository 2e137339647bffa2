//! Policy compilation
//!
//! Turns the validated configuration into the lookup structures the
//! decision engine iterates: interface→zone map, zone CIDRs, and
//! per-zone policy blocks with effective (own + inherited common)
//! rules. Compilation is where address and protocol strings become
//! typed matchers; anything that fails to parse is a validation error
//! carrying the offending field path.

use std::collections::HashMap;
use std::net::IpAddr;

use flywall_common::{proto, Config, Error, Result, RuleAction, RuleConfig};
use ipnetwork::IpNetwork;

/// Address predicate: CIDR when the config value contains '/',
/// exact equality otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpMatch {
    Cidr(IpNetwork),
    Exact(IpAddr),
}

impl IpMatch {
    pub fn parse(value: &str, field: &str) -> Result<Self> {
        if value.contains('/') {
            let net: IpNetwork = value.parse().map_err(|_| {
                Error::validation("invalid CIDR")
                    .with_attr("field", field)
                    .with_attr("value", value)
            })?;
            Ok(IpMatch::Cidr(net))
        } else {
            let ip: IpAddr = value.parse().map_err(|_| {
                Error::validation("invalid IP address")
                    .with_attr("field", field)
                    .with_attr("value", value)
            })?;
            Ok(IpMatch::Exact(ip))
        }
    }

    #[inline]
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpMatch::Cidr(net) => net.contains(ip),
            IpMatch::Exact(addr) => *addr == ip,
        }
    }
}

/// One rule after compilation. All configured predicates must match.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    /// Identifier surfaced with decisions: `rule:<policy>:<rule>`.
    pub rule_id: String,
    pub proto: Option<u8>,
    pub src: Option<IpMatch>,
    pub dst: Option<IpMatch>,
    pub src_ports: Vec<u16>,
    pub dst_ports: Vec<u16>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub invert_src: bool,
    pub invert_dst: bool,
    pub action: RuleAction,
}

impl CompiledRule {
    fn compile(rule: &RuleConfig, policy_name: &str, field: &str) -> Result<Self> {
        let proto_num = match &rule.proto {
            Some(name) => Some(proto::from_name(name).ok_or_else(|| {
                Error::validation("unknown protocol")
                    .with_attr("field", format!("{field}.proto"))
                    .with_attr("value", name)
            })?),
            None => None,
        };
        let src = rule
            .src
            .as_deref()
            .map(|v| IpMatch::parse(v, &format!("{field}.src")))
            .transpose()?;
        let dst = rule
            .dst
            .as_deref()
            .map(|v| IpMatch::parse(v, &format!("{field}.dst")))
            .transpose()?;
        if rule.invert_src && src.is_none() {
            return Err(Error::validation("invert_src without src predicate")
                .with_attr("field", format!("{field}.invert_src")));
        }
        if rule.invert_dst && dst.is_none() {
            return Err(Error::validation("invert_dst without dst predicate")
                .with_attr("field", format!("{field}.invert_dst")));
        }
        Ok(Self {
            name: rule.name.clone(),
            rule_id: format!("rule:{policy_name}:{}", rule.name),
            proto: proto_num,
            src,
            dst,
            src_ports: rule.src_ports.clone(),
            dst_ports: rule.dst_ports.clone(),
            in_iface: rule.in_iface.clone(),
            out_iface: rule.out_iface.clone(),
            invert_src: rule.invert_src,
            invert_dst: rule.invert_dst,
            action: rule.action,
        })
    }
}

/// One policy with its effective rule list.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub name: String,
    pub from_zone: String,
    pub to_zone: Option<String>,
    pub rules: Vec<CompiledRule>,
}

/// The whole active policy in engine-ready form.
#[derive(Debug, Default)]
pub struct CompiledPolicy {
    /// Interface name → zone name.
    pub iface_zones: HashMap<String, String>,
    /// Zone CIDRs, in zone declaration order.
    pub zone_cidrs: Vec<(IpNetwork, String)>,
    /// Source zone → policy blocks in declared order.
    pub by_zone: HashMap<String, Vec<CompiledBlock>>,
}

impl CompiledPolicy {
    /// Zone for an ingress interface.
    pub fn zone_for_iface(&self, iface: &str) -> Option<&str> {
        self.iface_zones.get(iface).map(|s| s.as_str())
    }

    /// Zone owning an address, by first matching CIDR.
    pub fn zone_for_ip(&self, ip: IpAddr) -> Option<&str> {
        self.zone_cidrs
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, zone)| zone.as_str())
    }
}

/// Compile a configuration into engine form.
pub fn compile(config: &Config) -> Result<CompiledPolicy> {
    let mut compiled = CompiledPolicy::default();

    for (zi, zone) in config.zones.iter().enumerate() {
        for iface in &zone.interfaces {
            if let Some(previous) = compiled
                .iface_zones
                .insert(iface.clone(), zone.name.clone())
            {
                return Err(Error::validation("interface claimed by two zones")
                    .with_attr("field", format!("zones[{zi}].interfaces"))
                    .with_attr("interface", iface)
                    .with_attr("zones", format!("{previous},{}", zone.name)));
            }
        }
        for (ci, cidr) in zone.cidrs.iter().enumerate() {
            let net: IpNetwork = cidr.parse().map_err(|_| {
                Error::validation("invalid zone CIDR")
                    .with_attr("field", format!("zones[{zi}].cidrs[{ci}]"))
                    .with_attr("value", cidr)
            })?;
            compiled.zone_cidrs.push((net, zone.name.clone()));
        }
    }

    for (pi, policy) in config.policies.iter().enumerate() {
        if config.zone(&policy.from_zone).is_none() {
            return Err(Error::validation("policy references unknown zone")
                .with_attr("field", format!("policies[{pi}].from_zone"))
                .with_attr("value", &policy.from_zone));
        }
        if let Some(to) = &policy.to_zone {
            if config.zone(to).is_none() {
                return Err(Error::validation("policy references unknown zone")
                    .with_attr("field", format!("policies[{pi}].to_zone"))
                    .with_attr("value", to));
            }
        }

        let mut rules = Vec::with_capacity(policy.rules.len() + config.common_rules.len());
        for (ri, rule) in policy.rules.iter().enumerate() {
            rules.push(CompiledRule::compile(
                rule,
                &policy.name,
                &format!("policies[{pi}].rules[{ri}]"),
            )?);
        }
        // Common rules are inherited after the policy's own rules.
        for (ri, rule) in config.common_rules.iter().enumerate() {
            rules.push(CompiledRule::compile(
                rule,
                &policy.name,
                &format!("common_rules[{ri}]"),
            )?);
        }

        compiled
            .by_zone
            .entry(policy.from_zone.clone())
            .or_default()
            .push(CompiledBlock {
                name: policy.name.clone(),
                from_zone: policy.from_zone.clone(),
                to_zone: policy.to_zone.clone(),
                rules,
            });
    }

    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flywall_common::{PolicyConfig, ZoneConfig};

    fn base_config() -> Config {
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
                rules: vec![],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn compiles_zone_lookups() {
        let compiled = compile(&base_config()).unwrap();
        assert_eq!(compiled.zone_for_iface("eth1"), Some("lan"));
        assert_eq!(compiled.zone_for_iface("eth9"), None);
        assert_eq!(
            compiled.zone_for_ip("192.168.1.77".parse().unwrap()),
            Some("lan")
        );
    }

    #[test]
    fn rejects_unknown_zone_reference() {
        let mut cfg = base_config();
        cfg.policies[0].from_zone = "dmz".into();
        let err = compile(&cfg).unwrap_err();
        assert_eq!(err.kind(), flywall_common::Kind::Validation);
        assert_eq!(err.attr("field"), Some("policies[0].from_zone"));
    }

    #[test]
    fn rejects_bad_cidr_with_path() {
        let mut cfg = base_config();
        cfg.zones[0].cidrs.push("10.0.0.0/33".into());
        let err = compile(&cfg).unwrap_err();
        assert_eq!(err.attr("field"), Some("zones[0].cidrs[1]"));
    }

    #[test]
    fn rejects_invert_without_predicate() {
        let mut cfg = base_config();
        cfg.policies[0].rules.push(RuleConfig {
            name: "odd".into(),
            proto: None,
            src: None,
            dst: None,
            src_ports: vec![],
            dst_ports: vec![],
            in_iface: None,
            out_iface: None,
            invert_src: true,
            invert_dst: false,
            action: RuleAction::Accept,
        });
        let err = compile(&cfg).unwrap_err();
        assert!(err.attr("field").unwrap().ends_with("invert_src"));
    }

    #[test]
    fn ip_match_cidr_vs_exact() {
        let cidr = IpMatch::parse("10.0.0.0/8", "f").unwrap();
        assert!(cidr.matches("10.9.9.9".parse().unwrap()));
        assert!(!cidr.matches("11.0.0.1".parse().unwrap()));

        let exact = IpMatch::parse("10.0.0.1", "f").unwrap();
        assert!(exact.matches("10.0.0.1".parse().unwrap()));
        assert!(!exact.matches("10.0.0.2".parse().unwrap()));
    }
}
