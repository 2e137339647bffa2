//! Parsed configuration consumed by the staged pipeline
//!
//! The on-disk syntax and its parser live outside the core; this is the
//! typed value the pipeline validates, transforms and applies.

use serde::{Deserialize, Serialize};

/// Terminal rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
}

impl RuleAction {
    /// Lowercased verdict string, as emitted with decisions.
    pub fn as_verdict(&self) -> &'static str {
        match self {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
            RuleAction::Reject => "reject",
        }
    }
}

/// One match-and-act rule. All configured predicates must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Protocol name, compared case-insensitively ("tcp", "UDP", ...).
    #[serde(default)]
    pub proto: Option<String>,
    /// Source IP or CIDR; CIDR when a '/' is present.
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub src_ports: Vec<u16>,
    #[serde(default)]
    pub dst_ports: Vec<u16>,
    #[serde(default)]
    pub in_iface: Option<String>,
    #[serde(default)]
    pub out_iface: Option<String>,
    #[serde(default)]
    pub invert_src: bool,
    #[serde(default)]
    pub invert_dst: bool,
    pub action: RuleAction,
}

/// Named set of interface/CIDR predicates; the unit of policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub cidrs: Vec<String>,
}

/// Ordered rules governing traffic from one zone (optionally to another).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub from_zone: String,
    #[serde(default)]
    pub to_zone: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Learning/offload controller knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Packets inspected before a flow can be trusted; valid range 3..=10.
    #[serde(default = "default_inspection_window")]
    pub inspection_window: u32,
    #[serde(default = "default_flow_timeout_secs")]
    pub flow_timeout_secs: u64,
    /// Packet mark signalling the stateless filter to short-circuit.
    #[serde(default = "default_offload_mark")]
    pub offload_mark: u32,
}

fn default_inspection_window() -> u32 {
    3
}

fn default_flow_timeout_secs() -> u64 {
    300
}

fn default_offload_mark() -> u32 {
    0x200000
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            inspection_window: default_inspection_window(),
            flow_timeout_secs: default_flow_timeout_secs(),
            offload_mark: default_offload_mark(),
        }
    }
}

/// Replicator role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Primary,
    Replica,
    Standby,
}

/// TLS material paths for the replication transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub ca_path: Option<String>,
    #[serde(default)]
    pub require_client_cert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
    #[serde(default = "default_replication_listen")]
    pub listen_addr: String,
    #[serde(default)]
    pub peer_addr: Option<String>,
    #[serde(default)]
    pub pre_shared_key: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn default_replication_listen() -> String {
    "0.0.0.0:9001".to_string()
}

/// Failback behavior after the higher-priority node returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailbackMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfig {
    /// 1-254; higher preempts on failback.
    pub priority: u8,
    pub vip: String,
    pub vip_interface: String,
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,
    #[serde(default)]
    pub peer_heartbeat_addr: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failback_delay_secs")]
    pub failback_delay_secs: u64,
    #[serde(default = "default_failback_mode")]
    pub failback_mode: FailbackMode,
}

fn default_heartbeat_port() -> u16 {
    9002
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_failback_delay_secs() -> u64 {
    10
}

fn default_failback_mode() -> FailbackMode {
    FailbackMode::Auto
}

/// Full candidate configuration fed into the pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    /// Rules inherited by every policy, after its own rules.
    #[serde(default)]
    pub common_rules: Vec<RuleConfig>,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub replication: Option<ReplicationConfig>,
    #[serde(default)]
    pub ha: Option<HaConfig>,
}

impl Eq for Config {}

impl Config {
    pub fn zone(&self, name: &str) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_learning_section() {
        let cfg: Config = serde_json::from_str(r#"{"zones": [], "policies": []}"#).unwrap();
        assert_eq!(cfg.learning.inspection_window, 3);
        assert_eq!(cfg.learning.flow_timeout_secs, 300);
        assert_eq!(cfg.learning.offload_mark, 0x200000);
    }

    #[test]
    fn action_round_trips_lowercase() {
        let a: RuleAction = serde_json::from_str(r#""reject""#).unwrap();
        assert_eq!(a, RuleAction::Reject);
        assert_eq!(serde_json::to_string(&RuleAction::Accept).unwrap(), r#""accept""#);
    }

    #[test]
    fn config_round_trips() {
        let cfg = Config {
            zones: vec![ZoneConfig {
                name: "lan".into(),
                interfaces: vec!["eth1".into()],
                cidrs: vec!["192.168.1.0/24".into()],
            }],
            policies: vec![PolicyConfig {
                name: "lan-out".into(),
                from_zone: "lan".into(),
                to_zone: Some("wan".into()),
                rules: vec![RuleConfig {
                    name: "web".into(),
                    proto: Some("tcp".into()),
                    src: None,
                    dst: None,
                    src_ports: vec![],
                    dst_ports: vec![80, 443],
                    in_iface: None,
                    out_iface: None,
                    invert_src: false,
                    invert_dst: false,
                    action: RuleAction::Accept,
                }],
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
