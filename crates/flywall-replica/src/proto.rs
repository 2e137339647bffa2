//! Replication wire protocol
//!
//! Frames are length-prefixed (u32 big-endian) JSON documents with a
//! self-describing `type` tag. Length-prefixing keeps snapshots with
//! embedded newlines unambiguous.

use bytes::BytesMut;
use flywall_common::{Error, Result};
use flywall_store::{Change, Snapshot};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame; snapshots dominate.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Every message on the replication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Server → client: authentication challenge.
    Auth { nonce: String },
    /// Client → server: HMAC over the nonce.
    AuthResponse { mac: String },
    /// Server → client: challenge passed.
    AuthOk,
    /// Client → server: sync position; 0 forces a snapshot.
    Version { version: u64 },
    Snapshot { snapshot: Snapshot },
    Changes { changes: Vec<Change> },
    Change { change: Change },
}

impl Frame {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::AuthResponse { .. } => "auth_response",
            Frame::AuthOk => "auth_ok",
            Frame::Version { .. } => "version",
            Frame::Snapshot { .. } => "snapshot",
            Frame::Changes { .. } => "changes",
            Frame::Change { .. } => "change",
        }
    }
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME {
        return Err(Error::internal("frame exceeds size limit")
            .with_attr("frame", frame.tag())
            .with_attr("len", payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(Error::internal("incoming frame exceeds size limit").with_attr("len", len));
    }
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
