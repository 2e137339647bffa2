//! Flywall HA - virtual-IP failover between two peers
//!
//! Heartbeats are periodic JSON datagrams on a dedicated UDP port
//! carrying priority, store version and timestamp. A standby claims the
//! VIP after the peer falls silent; a stronger node reclaims it after a
//! stable observation window while the weaker active yields. Priority 1
//! is the strongest; ties break on the lexicographically smaller node
//! id.
//!
//! A node in replica mode must not claim the VIP while its replicator
//! is unsynced, so activating never serves stale state.

#![warn(clippy::all)]

pub mod vip;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flywall_common::{Error, FailbackMode, HaConfig, Platform, Result, ShutdownHandle};
use flywall_replica::SyncState;
use flywall_store::StateStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use vip::{LinuxVip, MemVip, VipHandle};

/// Current role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Standby,
    Active,
}

/// One heartbeat datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub priority: u8,
    pub version: u64,
    pub timestamp_ns: u64,
}

/// Observable controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaState {
    pub priority: u8,
    pub role: Role,
    pub last_peer_heartbeat_ns: u64,
    pub owns_vip: bool,
    pub peer_priority: Option<u8>,
    pub peer_version: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    role: Role,
    owns_vip: bool,
    last_peer_heartbeat_ns: u64,
    peer_priority: Option<u8>,
    peer_node: Option<String>,
    peer_version: Option<u64>,
    /// Standby: since when a live but weaker active peer has been
    /// continuously observed (preemption window).
    weaker_since_ns: Option<u64>,
    /// Active: since when a stronger peer has been continuously
    /// observed (yield window).
    stronger_since_ns: Option<u64>,
}

/// Priority-based VIP ownership controller.
pub struct HaController {
    platform: Platform,
    config: HaConfig,
    vip: Arc<dyn VipHandle>,
    store: Arc<StateStore>,
    /// Present in replica mode; gates VIP claims on sync state.
    sync_gate: Option<watch::Receiver<SyncState>>,
    role_tx: watch::Sender<Role>,
    inner: Mutex<Inner>,
}

impl HaController {
    pub fn new(
        platform: Platform,
        config: HaConfig,
        vip: Arc<dyn VipHandle>,
        store: Arc<StateStore>,
        sync_gate: Option<watch::Receiver<SyncState>>,
    ) -> Result<Arc<Self>> {
        if config.priority == 0 || config.priority == 255 {
            return Err(Error::validation("priority must be within 1-254")
                .with_attr("field", "ha.priority")
                .with_attr("value", config.priority));
        }
        let now = platform.now_ns();
        let (role_tx, _) = watch::channel(Role::Standby);
        Ok(Arc::new(Self {
            platform,
            config,
            vip,
            store,
            sync_gate,
            role_tx,
            inner: Mutex::new(Inner {
                role: Role::Standby,
                owns_vip: false,
                // Grace period at boot: silence counts from startup.
                last_peer_heartbeat_ns: now,
                peer_priority: None,
                peer_node: None,
                peer_version: None,
                weaker_since_ns: None,
                stronger_since_ns: None,
            }),
        }))
    }

    /// Observe role changes (consumed by the replicator mode switch).
    pub fn role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn state(&self) -> HaState {
        let inner = self.inner.lock();
        HaState {
            priority: self.config.priority,
            role: inner.role,
            last_peer_heartbeat_ns: inner.last_peer_heartbeat_ns,
            owns_vip: inner.owns_vip,
            peer_priority: inner.peer_priority,
            peer_version: inner.peer_version,
        }
    }

    /// Run heartbeating and the failover state machine until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownHandle) -> Result<()> {
        let socket = self.bind_heartbeat_socket()?;
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = [0u8; 2048];

        info!(
            node = %self.platform.node_id,
            priority = self.config.priority,
            port = self.config.heartbeat_port,
            "HA controller running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_heartbeat(&socket).await;
                    self.evaluate();
                }
                received = socket.recv_from(&mut buf) => {
                    if let Ok((len, from)) = received {
                        self.on_datagram(&buf[..len], from);
                    }
                }
                _ = shutdown.wait() => {
                    self.step_down("shutdown");
                    return Ok(());
                }
            }
        }
    }

    fn bind_heartbeat_socket(&self) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.heartbeat_port)
            .parse()
            .map_err(|_| Error::validation("invalid heartbeat port"))?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn send_heartbeat(&self, socket: &UdpSocket) {
        let Some(peer) = self.config.peer_heartbeat_addr.as_deref() else {
            return;
        };
        let hb = Heartbeat {
            node_id: self.platform.node_id.clone(),
            priority: self.config.priority,
            version: self.store.current_version(),
            timestamp_ns: self.platform.now_ns(),
        };
        match serde_json::to_vec(&hb) {
            Ok(payload) => {
                if let Err(e) = socket.send_to(&payload, peer).await {
                    debug!(peer, error = %e, "heartbeat send failed");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat serialization failed"),
        }
    }

    fn on_datagram(&self, payload: &[u8], from: SocketAddr) {
        let hb: Heartbeat = match serde_json::from_slice(payload) {
            Ok(hb) => hb,
            Err(e) => {
                debug!(%from, error = %e, "malformed heartbeat ignored");
                return;
            }
        };
        if hb.node_id == self.platform.node_id {
            return;
        }
        let now = self.platform.now_ns();
        let mut inner = self.inner.lock();
        inner.last_peer_heartbeat_ns = now;
        inner.peer_priority = Some(hb.priority);
        inner.peer_version = Some(hb.version);
        inner.peer_node = Some(hb.node_id);
    }

    /// Rank comparison. Priority 1 is strongest; ties break on the
    /// smaller node id.
    fn peer_outranks_us(&self, peer_priority: u8, peer_node: &str) -> bool {
        (peer_priority, peer_node) < (self.config.priority, self.platform.node_id.as_str())
    }

    fn sync_allows_claim(&self) -> bool {
        match &self.sync_gate {
            Some(rx) => *rx.borrow() == SyncState::Synced,
            None => true,
        }
    }

    /// (peer_alive, peer_outranks) as of `now`. Shared by the periodic
    /// evaluation and the operator-triggered paths.
    fn peer_view(&self, inner: &Inner, now: u64) -> (bool, bool) {
        let threshold_ns =
            self.config.failure_threshold as u64 * self.config.heartbeat_interval_ms * 1_000_000;
        let silence = now.saturating_sub(inner.last_peer_heartbeat_ns);
        let peer_alive = silence <= threshold_ns;
        let peer_outranks = match (&inner.peer_priority, &inner.peer_node) {
            (Some(priority), Some(node)) if peer_alive => self.peer_outranks_us(*priority, node),
            _ => false,
        };
        (peer_alive, peer_outranks)
    }

    /// Operator-triggered takeover, the failback path in manual mode.
    ///
    /// Runs the same rank and sync checks as the automatic path but
    /// without the stability window: a live peer that outranks this
    /// node refuses the takeover, an unsynced replicator refuses it,
    /// anything else claims the VIP immediately.
    pub fn manual_takeover(&self) -> Result<()> {
        if !self.sync_allows_claim() {
            return Err(Error::unavailable(
                "replicator not synced; refusing manual takeover",
            ));
        }
        let now = self.platform.now_ns();
        {
            let inner = self.inner.lock();
            if inner.owns_vip {
                return Ok(());
            }
            let (peer_alive, peer_outranks) = self.peer_view(&inner, now);
            if peer_alive && peer_outranks {
                return Err(Error::conflict("live peer outranks this node")
                    .with_attr("priority", self.config.priority)
                    .with_attr(
                        "peer_priority",
                        inner
                            .peer_priority
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                    ));
            }
        }
        self.take_over("manual takeover");
        Ok(())
    }

    /// Operator-triggered step-down: release the VIP so the peer can
    /// claim it. Refused when this node is not active.
    pub fn manual_failback(&self) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.role != Role::Active {
                return Err(Error::conflict("node is not active")
                    .with_attr("role", format!("{:?}", inner.role)));
            }
        }
        self.step_down("manual failback");
        Ok(())
    }

    fn evaluate(&self) {
        let now = self.platform.now_ns();
        let failback_ns = self.config.failback_delay_secs * 1_000_000_000;
        let auto = self.config.failback_mode == FailbackMode::Auto;

        let mut inner = self.inner.lock();
        let (peer_alive, peer_outranks) = self.peer_view(&inner, now);

        match inner.role {
            Role::Standby => {
                inner.stronger_since_ns = None;
                if !peer_alive {
                    inner.weaker_since_ns = None;
                    if self.sync_allows_claim() {
                        drop(inner);
                        self.take_over("peer heartbeat lost");
                    } else {
                        debug!("peer silent but replicator unsynced; deferring VIP claim");
                    }
                } else if auto && inner.peer_priority.is_some() && !peer_outranks {
                    // Failback preemption: this node outranks the live
                    // peer; reclaim after a stable observation window.
                    let since = *inner.weaker_since_ns.get_or_insert(now);
                    if now.saturating_sub(since) >= failback_ns && self.sync_allows_claim() {
                        drop(inner);
                        self.take_over("preempting weaker active peer");
                    }
                } else {
                    inner.weaker_since_ns = None;
                }
            }
            Role::Active => {
                inner.weaker_since_ns = None;
                if peer_outranks {
                    let since = *inner.stronger_since_ns.get_or_insert(now);
                    if auto && now.saturating_sub(since) >= failback_ns {
                        drop(inner);
                        self.step_down("stronger peer returned");
                    }
                } else {
                    inner.stronger_since_ns = None;
                }
            }
        }
    }

    fn take_over(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.owns_vip {
            return;
        }
        if let Err(e) = self.vip.claim(&self.config.vip, &self.config.vip_interface) {
            warn!(error = %e, "VIP claim failed");
            return;
        }
        if let Err(e) = self
            .vip
            .gratuitous_arp(&self.config.vip, &self.config.vip_interface)
        {
            debug!(error = %e, "gratuitous ARP failed");
        }
        inner.owns_vip = true;
        inner.role = Role::Active;
        inner.weaker_since_ns = None;
        drop(inner);
        info!(reason, vip = %self.config.vip, "FAILOVER: this node is now active");
        metrics::counter!("flywall_ha_failovers_total").increment(1);
        let _ = self.role_tx.send(Role::Active);
    }

    fn step_down(&self, reason: &str) {
        let mut inner = self.inner.lock();
        let owned = inner.owns_vip;
        if owned {
            if let Err(e) = self
                .vip
                .release(&self.config.vip, &self.config.vip_interface)
            {
                warn!(error = %e, "VIP release failed");
            }
        }
        inner.owns_vip = false;
        inner.role = Role::Standby;
        inner.stronger_since_ns = None;
        drop(inner);
        if owned {
            info!(reason, vip = %self.config.vip, "FAILBACK: this node is now standby");
            metrics::counter!("flywall_ha_failbacks_total").increment(1);
        }
        let _ = self.role_tx.send(Role::Standby);
    }
}
