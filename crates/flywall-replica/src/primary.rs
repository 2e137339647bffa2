//! Primary-side replication endpoint
//!
//! Accepts replica connections, authenticates them, serves the initial
//! snapshot or backlog, then forwards every committed change. Each
//! replica has its own bounded buffer (the store subscription); a slow
//! or dead replica is dropped without stalling the producer or the
//! other replicas.

use std::sync::Arc;

use flywall_common::{Error, ReplicationConfig, Result, ShutdownHandle};
use flywall_store::StateStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::server_handshake;
use crate::proto::{read_frame, write_frame, Frame};

/// Replication server for the Primary role.
pub struct Primary {
    store: Arc<StateStore>,
    settings: ReplicationConfig,
    tls: Option<TlsAcceptor>,
}

impl Primary {
    pub fn new(store: Arc<StateStore>, settings: ReplicationConfig) -> Result<Arc<Self>> {
        let tls = settings
            .tls
            .as_ref()
            .map(crate::tls::acceptor)
            .transpose()?;
        Ok(Arc::new(Self {
            store,
            settings,
            tls,
        }))
    }

    /// Bind the configured listen address and serve until shutdown.
    pub async fn bind_and_serve(self: Arc<Self>, shutdown: ShutdownHandle) -> Result<()> {
        let listener = TcpListener::bind(&self.settings.listen_addr).await?;
        info!(addr = %self.settings.listen_addr, "replication endpoint listening");
        self.serve(listener, shutdown).await
    }

    /// Serve replicas from an already-bound listener.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: ShutdownHandle,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "replica connected");
                    let this = self.clone();
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_conn(stream, conn_shutdown).await {
                            debug!(%peer, error = %e, "replica session ended");
                        }
                    });
                }
                _ = shutdown.wait() => {
                    debug!("replication endpoint shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_conn(&self, stream: TcpStream, shutdown: ShutdownHandle) -> Result<()> {
        match &self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                self.run_session(tls_stream, shutdown).await
            }
            None => self.run_session(stream, shutdown).await,
        }
    }

    async fn run_session<S>(&self, mut conn: S, mut shutdown: ShutdownHandle) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(key) = &self.settings.pre_shared_key {
            if let Err(e) = server_handshake(&mut conn, key).await {
                warn!(error = %e, "replica failed authentication");
                metrics::counter!("flywall_replication_auth_failures_total").increment(1);
                return Err(e);
            }
        }

        let requested = match read_frame(&mut conn).await? {
            Frame::Version { version } => version,
            other => {
                return Err(
                    Error::internal("expected version frame").with_attr("frame", other.tag())
                )
            }
        };

        // Subscribe before reading the backlog so no commit can fall
        // between backlog and live stream.
        let mut sub = self.store.subscribe();

        let mut last_sent = if requested == 0 {
            let snapshot = self.store.create_snapshot()?;
            let version = snapshot.version;
            debug!(version, "serving full snapshot");
            metrics::counter!("flywall_replication_snapshots_served_total").increment(1);
            write_frame(&mut conn, &Frame::Snapshot { snapshot }).await?;
            version
        } else {
            let changes = self.store.get_changes_since(requested)?;
            let last = changes.last().map(|c| c.version).unwrap_or(requested);
            debug!(from = requested, count = changes.len(), "serving change backlog");
            write_frame(&mut conn, &Frame::Changes { changes }).await?;
            last
        };

        loop {
            tokio::select! {
                change = sub.recv() => {
                    match change {
                        Some(change) if change.version > last_sent => {
                            last_sent = change.version;
                            write_frame(&mut conn, &Frame::Change { change }).await?;
                        }
                        // Backlog overlap: already sent above.
                        Some(_) => {}
                        // Our subscription was dropped as slow; the
                        // replica reconnects and resyncs.
                        None => {
                            warn!("replica forwarding buffer overflowed; closing session");
                            return Err(Error::unavailable("replica buffer overflow"));
                        }
                    }
                }
                _ = shutdown.wait() => return Ok(()),
            }
        }
    }
}
