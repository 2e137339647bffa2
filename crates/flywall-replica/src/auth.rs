//! Pre-shared-key handshake
//!
//! The server sends a 32-byte random nonce (hex); the client answers
//! with `HMAC_SHA256(nonce, key)` hex-encoded; verification is
//! constant-time. A failed handshake closes the connection with an
//! `Unauthorized` result and leaks nothing about the key.

use flywall_common::{Error, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::proto::{read_frame, write_frame, Frame};

type HmacSha256 = Hmac<Sha256>;

/// Fresh hex-encoded 32-byte nonce.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn mac_for(nonce_hex: &str, key: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| Error::internal("hmac key setup failed"))?;
    mac.update(nonce_hex.as_bytes());
    Ok(mac)
}

/// Client-side response to a challenge.
pub fn sign_nonce(nonce_hex: &str, key: &str) -> Result<String> {
    Ok(hex::encode(mac_for(nonce_hex, key)?.finalize().into_bytes()))
}

/// Constant-time verification of a client response.
pub fn verify_response(nonce_hex: &str, key: &str, mac_hex: &str) -> Result<()> {
    let provided =
        hex::decode(mac_hex).map_err(|_| Error::unauthorized("malformed handshake response"))?;
    mac_for(nonce_hex, key)?
        .verify_slice(&provided)
        .map_err(|_| Error::unauthorized("handshake verification failed"))
}

/// Run the server side of the handshake on a fresh connection.
pub async fn server_handshake<S>(conn: &mut S, key: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = new_nonce();
    write_frame(conn, &Frame::Auth { nonce: nonce.clone() }).await?;
    let mac = match read_frame(conn).await? {
        Frame::AuthResponse { mac } => mac,
        other => {
            return Err(Error::unauthorized("expected handshake response")
                .with_attr("frame", other.tag()))
        }
    };
    verify_response(&nonce, key, &mac)?;
    write_frame(conn, &Frame::AuthOk).await?;
    debug!("replication peer authenticated");
    Ok(())
}

/// Run the client side of the handshake.
pub async fn client_handshake<S>(conn: &mut S, key: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = match read_frame(conn).await? {
        Frame::Auth { nonce } => nonce,
        other => {
            return Err(
                Error::unauthorized("expected handshake challenge").with_attr("frame", other.tag())
            )
        }
    };
    let mac = sign_nonce(&nonce, key)?;
    write_frame(conn, &Frame::AuthResponse { mac }).await?;
    match read_frame(conn).await {
        Ok(Frame::AuthOk) => Ok(()),
        Ok(other) => Err(Error::unauthorized("handshake rejected").with_attr("frame", other.tag())),
        // The server closes the socket on failure.
        Err(_) => Err(Error::unauthorized("handshake rejected")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flywall_common::Kind;

    #[test]
    fn sign_and_verify_round_trip() {
        let nonce = new_nonce();
        let mac = sign_nonce(&nonce, "secret").unwrap();
        verify_response(&nonce, "secret", &mac).unwrap();
    }

    #[test]
    fn wrong_key_fails_closed() {
        let nonce = new_nonce();
        let mac = sign_nonce(&nonce, "wrong").unwrap();
        let err = verify_response(&nonce, "secret", &mac).unwrap_err();
        assert_eq!(err.kind(), Kind::Unauthorized);
        // No key material in the error surface.
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn malformed_mac_is_unauthorized() {
        let err = verify_response(&new_nonce(), "secret", "not-hex!").unwrap_err();
        assert_eq!(err.kind(), Kind::Unauthorized);
    }

    #[tokio::test]
    async fn handshake_succeeds_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task =
            tokio::spawn(async move { server_handshake(&mut server, "shared").await });
        client_handshake(&mut client, "shared").await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_mismatched_keys() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let result = server_handshake(&mut server, "right").await;
            drop(server); // close on failure, no data leakage
            result
        });
        let client_err = client_handshake(&mut client, "wrong").await.unwrap_err();
        assert_eq!(client_err.kind(), Kind::Unauthorized);
        let server_err = server_task.await.unwrap().unwrap_err();
        assert_eq!(server_err.kind(), Kind::Unauthorized);
    }
}
