//! Ruleset artifact applied to the datapath
//!
//! The staged pipeline compiles the active configuration into this
//! structure; the kernel applies it as one transaction. Chain names
//! embed stable identifiers (`policy-<from>-to-<to>`) so counters read
//! back from the kernel can be correlated to policy names.

use serde::{Deserialize, Serialize};

use crate::counter_names;

/// One chain of rendered rule statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetChain {
    pub name: String,
    pub rules: Vec<String>,
}

/// A complete datapath ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruleset {
    /// Table everything lives in.
    pub table: String,
    pub chains: Vec<RulesetChain>,
    /// Mark that short-circuits the stateless filter for trusted flows.
    pub bypass_mark: u32,
}

impl Ruleset {
    pub fn new(bypass_mark: u32) -> Self {
        Self {
            table: "flywall".to_string(),
            chains: Vec::new(),
            bypass_mark,
        }
    }

    /// Stable chain name for a policy between two zones.
    pub fn policy_chain_name(from: &str, to: Option<&str>) -> String {
        match to {
            Some(to) => format!("policy-{from}-to-{to}"),
            None => format!("policy-{from}-to-any"),
        }
    }

    pub fn add_chain(&mut self, name: impl Into<String>, rules: Vec<String>) {
        self.chains.push(RulesetChain {
            name: name.into(),
            rules,
        });
    }

    pub fn chain(&self, name: &str) -> Option<&RulesetChain> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// The statistics chain every ruleset carries.
    pub fn statistics_chain() -> RulesetChain {
        RulesetChain {
            name: "statistics".to_string(),
            rules: vec![
                format!("tcp flags syn / syn,ack counter name {}", counter_names::SYN),
                format!("tcp flags rst counter name {}", counter_names::RST),
                format!("tcp flags fin counter name {}", counter_names::FIN),
                format!("meta l4proto udp counter name {}", counter_names::UDP),
                format!("meta l4proto icmp counter name {}", counter_names::ICMP),
            ],
        }
    }

    /// Render the whole ruleset as one nft script. Flushing the table
    /// first inside the same script keeps the apply transactional.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("table inet {} {{}}\n", self.table));
        out.push_str(&format!("flush table inet {}\n", self.table));
        out.push_str(&format!("table inet {} {{\n", self.table));
        out.push_str("  set blocklist {\n    type ipv4_addr\n    flags interval\n  }\n");
        for counter in [
            counter_names::SYN,
            counter_names::RST,
            counter_names::FIN,
            counter_names::UDP,
            counter_names::ICMP,
        ] {
            out.push_str(&format!("  counter {counter} {{}}\n"));
        }
        for chain in &self.chains {
            out.push_str(&format!("  chain {} {{\n", chain.name));
            for rule in &chain.rules {
                out.push_str(&format!("    {rule}\n"));
            }
            out.push_str("  }\n");
        }
        out.push_str("}\n");
        out
    }
}
