//! Kernel datapath abstraction
//!
//! One contract, two implementations: [`NativeKernel`] binds the host's
//! conntrack table, named counters and address sets; [`SimKernel`] drives
//! an in-memory flow table from injected packets for tests and replay.
//!
//! Missing flows or counters are empty results, never errors. The
//! kernel's `now()` is the only clock the datapath sees, which is what
//! lets tests dilate time.

#![warn(clippy::all)]

pub mod conntrack;
pub mod native;
pub mod ruleset;
pub mod sim;

use std::collections::HashMap;
use std::net::IpAddr;

use flywall_common::Result;

pub use conntrack::Flow;
pub use native::NativeKernel;
pub use ruleset::{Ruleset, RulesetChain};
pub use sim::{SimKernel, SimTimeouts};

/// Uniform interface over the Linux datapath and the simulator.
pub trait Kernel: Send + Sync {
    /// All currently tracked flows. Expired entries are not returned.
    fn dump_flows(&self) -> Result<Vec<Flow>>;

    /// Flow by id, or `None`.
    fn get_flow(&self, id: u64) -> Result<Option<Flow>>;

    /// Remove a tracked flow. Returns whether it existed.
    fn kill_flow(&self, id: u64) -> Result<bool>;

    /// Add an address to the kernel blocklist set.
    fn add_block(&self, ip: IpAddr) -> Result<()>;

    /// Remove an address from the blocklist set.
    fn remove_block(&self, ip: IpAddr) -> Result<()>;

    fn is_blocked(&self, ip: IpAddr) -> Result<bool>;

    /// Nanoseconds since the epoch, from the platform clock.
    fn now(&self) -> u64;

    /// Named counters from the statistics chain. Absent counters are
    /// simply absent from the map.
    fn counters(&self) -> Result<HashMap<String, u64>>;

    /// Apply a full ruleset in a single transaction: either the whole
    /// ruleset takes effect or the prior one remains active.
    fn apply_ruleset(&self, ruleset: &Ruleset) -> Result<()>;
}

/// Counter names in the statistics chain.
pub mod counter_names {
    pub const SYN: &str = "cnt_syn";
    pub const RST: &str = "cnt_rst";
    pub const FIN: &str = "cnt_fin";
    pub const UDP: &str = "cnt_udp";
    pub const ICMP: &str = "cnt_icmp";
}
