//! Virtual IP manipulation
//!
//! The controller owns the decision; this trait owns the mechanism.
//! `LinuxVip` drives `ip`/`arping`; `MemVip` backs tests, optionally
//! sharing an ownership registry between simulated nodes.

use std::process::Command;
use std::sync::Arc;

use flywall_common::{Error, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Mechanism for acquiring and releasing the VIP.
pub trait VipHandle: Send + Sync {
    fn claim(&self, vip: &str, iface: &str) -> Result<()>;
    fn release(&self, vip: &str, iface: &str) -> Result<()>;
    /// Announce the new owner to the L2 segment.
    fn gratuitous_arp(&self, vip: &str, iface: &str) -> Result<()>;
}

/// Host implementation over iproute2.
#[derive(Debug, Default)]
pub struct LinuxVip;

impl LinuxVip {
    fn run(program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::unavailable(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            return Err(Error::internal(format!("{program} failed"))
                .with_attr("args", args.join(" "))
                .with_attr(
                    "stderr",
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
        }
        Ok(())
    }
}

impl VipHandle for LinuxVip {
    fn claim(&self, vip: &str, iface: &str) -> Result<()> {
        let addr = format!("{vip}/32");
        Self::run("ip", &["addr", "add", &addr, "dev", iface])?;
        info!(vip, iface, "virtual IP claimed");
        Ok(())
    }

    fn release(&self, vip: &str, iface: &str) -> Result<()> {
        let addr = format!("{vip}/32");
        Self::run("ip", &["addr", "del", &addr, "dev", iface])?;
        info!(vip, iface, "virtual IP released");
        Ok(())
    }

    fn gratuitous_arp(&self, vip: &str, iface: &str) -> Result<()> {
        Self::run("arping", &["-U", "-c", "1", "-I", iface, vip])?;
        debug!(vip, iface, "gratuitous ARP sent");
        Ok(())
    }
}

/// In-memory VIP for tests. Nodes sharing a registry model one L2
/// segment; the registry records the current owner.
pub struct MemVip {
    node: String,
    registry: Arc<Mutex<Option<String>>>,
    arps: Mutex<u64>,
}

impl MemVip {
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_registry(node, Arc::new(Mutex::new(None)))
    }

    pub fn with_registry(node: impl Into<String>, registry: Arc<Mutex<Option<String>>>) -> Self {
        Self {
            node: node.into(),
            registry,
            arps: Mutex::new(0),
        }
    }

    /// Shared ownership registry for multi-node tests.
    pub fn registry(&self) -> Arc<Mutex<Option<String>>> {
        self.registry.clone()
    }

    pub fn owner(&self) -> Option<String> {
        self.registry.lock().clone()
    }

    pub fn owns(&self) -> bool {
        self.owner().as_deref() == Some(self.node.as_str())
    }

    pub fn arp_count(&self) -> u64 {
        *self.arps.lock()
    }
}

impl VipHandle for MemVip {
    fn claim(&self, _vip: &str, _iface: &str) -> Result<()> {
        *self.registry.lock() = Some(self.node.clone());
        Ok(())
    }

    fn release(&self, _vip: &str, _iface: &str) -> Result<()> {
        let mut owner = self.registry.lock();
        if owner.as_deref() == Some(self.node.as_str()) {
            *owner = None;
        }
        Ok(())
    }

    fn gratuitous_arp(&self, _vip: &str, _iface: &str) -> Result<()> {
        *self.arps.lock() += 1;
        Ok(())
    }
}
