//! Replica-side sync loop and reverse sync
//!
//! The replica connects to the primary, authenticates, announces its
//! version and applies the resulting snapshot or backlog, then follows
//! the live change stream. Divergence flips the `force_snapshot` flag,
//! disconnects, and the next connect requests version 0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flywall_common::{Error, Kind, ReplicationConfig, Result, ShutdownHandle};
use flywall_store::{Change, StateStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::client_handshake;
use crate::proto::{read_frame, write_frame, Frame};

/// Where the replica stands relative to its primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Connecting,
    Syncing,
    Synced,
    Diverged,
}

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Replication client for the Replica role.
pub struct Replica {
    store: Arc<StateStore>,
    settings: ReplicationConfig,
    state_tx: watch::Sender<SyncState>,
    force_snapshot: AtomicBool,
}

impl Replica {
    pub fn new(store: Arc<StateStore>, settings: ReplicationConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SyncState::Connecting);
        Arc::new(Self {
            store,
            settings,
            state_tx,
            force_snapshot: AtomicBool::new(false),
        })
    }

    /// Observe the sync state; the HA controller gates VIP claims on it.
    pub fn sync_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Run the sync loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownHandle) {
        let mut backoff = BACKOFF_MIN;
        loop {
            if shutdown.is_signalled() {
                return;
            }
            self.state_tx.send_replace(SyncState::Connecting);
            match self.sync_once(&mut shutdown).await {
                Ok(()) => return, // shutdown requested mid-stream
                Err(e) if e.kind() == Kind::Divergence => {
                    self.force_snapshot.store(true, Ordering::SeqCst);
                    self.state_tx.send_replace(SyncState::Diverged);
                    warn!(error = %e, "divergence detected; full snapshot on next connect");
                    metrics::counter!("flywall_replication_divergences_total").increment(1);
                    backoff = BACKOFF_MIN;
                }
                Err(e) => {
                    debug!(error = %e, "replication link lost; reconnecting");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.wait() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn sync_once(&self, shutdown: &mut ShutdownHandle) -> Result<()> {
        let peer = self.settings.peer_addr.as_deref().ok_or_else(|| {
            Error::validation("replica requires a peer address")
                .with_attr("field", "replication.peer_addr")
        })?;
        let stream = TcpStream::connect(peer).await?;

        match &self.settings.tls {
            Some(tls) => {
                let connector = crate::tls::connector(tls)?;
                let name = crate::tls::server_name(peer)?;
                let stream = connector.connect(name, stream).await?;
                self.run_stream(stream, shutdown).await
            }
            None => self.run_stream(stream, shutdown).await,
        }
    }

    async fn run_stream<S>(&self, mut conn: S, shutdown: &mut ShutdownHandle) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(key) = &self.settings.pre_shared_key {
            client_handshake(&mut conn, key).await?;
        }

        let version = if self.force_snapshot.swap(false, Ordering::SeqCst) {
            0
        } else {
            self.store.current_version()
        };
        write_frame(&mut conn, &Frame::Version { version }).await?;
        self.state_tx.send_replace(SyncState::Syncing);

        match read_frame(&mut conn).await? {
            Frame::Snapshot { snapshot } => {
                info!(version = snapshot.version, "restoring snapshot from primary");
                self.store.restore_snapshot(&snapshot)?;
            }
            Frame::Changes { changes } => {
                debug!(count = changes.len(), "applying change backlog");
                for change in changes {
                    self.apply(change)?;
                }
            }
            other => {
                return Err(Error::internal("unexpected sync reply").with_attr("frame", other.tag()))
            }
        }
        self.state_tx.send_replace(SyncState::Synced);

        loop {
            tokio::select! {
                frame = read_frame(&mut conn) => {
                    match frame? {
                        Frame::Change { change } => self.apply(change)?,
                        other => {
                            return Err(Error::internal("unexpected stream frame")
                                .with_attr("frame", other.tag()))
                        }
                    }
                }
                _ = shutdown.wait() => return Ok(()),
            }
        }
    }

    fn apply(&self, change: Change) -> Result<()> {
        self.store.apply_replicated_change(&change)
    }
}

/// Pre-start snapshot pull for a node coming up as Primary.
///
/// After a role reversal the restarting node must not serve stale
/// state, so it tries its peer's replication port first. The peer
/// normally runs as a Replica with no listener, making the connect fail
/// fast; that is the expected path and startup proceeds.
pub async fn reverse_sync(
    store: &StateStore,
    settings: &ReplicationConfig,
    deadline: Duration,
) -> Result<bool> {
    let Some(peer) = settings.peer_addr.as_deref() else {
        return Ok(false);
    };
    let result = timeout(deadline, pull_snapshot(store, settings, peer)).await;
    match result {
        Ok(Ok(version)) => {
            info!(version, peer, "reverse sync pulled peer snapshot");
            Ok(true)
        }
        Ok(Err(e)) => {
            debug!(peer, error = %e, "reverse sync skipped");
            Ok(false)
        }
        Err(_) => {
            debug!(peer, "reverse sync timed out; proceeding with local state");
            Ok(false)
        }
    }
}

async fn pull_snapshot(
    store: &StateStore,
    settings: &ReplicationConfig,
    peer: &str,
) -> Result<u64> {
    let stream = TcpStream::connect(peer).await?;
    match &settings.tls {
        Some(tls) => {
            let connector = crate::tls::connector(tls)?;
            let name = crate::tls::server_name(peer)?;
            let stream = connector.connect(name, stream).await?;
            pull_snapshot_stream(store, settings, stream).await
        }
        None => pull_snapshot_stream(store, settings, stream).await,
    }
}

async fn pull_snapshot_stream<S>(
    store: &StateStore,
    settings: &ReplicationConfig,
    mut conn: S,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(key) = &settings.pre_shared_key {
        client_handshake(&mut conn, key).await?;
    }
    write_frame(&mut conn, &Frame::Version { version: 0 }).await?;
    match read_frame(&mut conn).await? {
        Frame::Snapshot { snapshot } => {
            let version = snapshot.version;
            store.restore_snapshot(&snapshot)?;
            Ok(version)
        }
        other => Err(Error::internal("expected snapshot").with_attr("frame", other.tag())),
    }
}
