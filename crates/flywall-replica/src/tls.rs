//! TLS material loading for the replication transport
//!
//! Plain TCP is the default; TLS (optionally mutual) is switched on by
//! configuring cert/key/CA paths.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use flywall_common::{Error, Result, TlsConfig};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::validation(format!("cannot open certificate: {e}"))
            .with_attr("path", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| {
            Error::validation(format!("malformed certificate: {e}")).with_attr("path", path)
        })
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::validation(format!("cannot open key: {e}")).with_attr("path", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::validation(format!("malformed key: {e}")).with_attr("path", path))?
        .ok_or_else(|| Error::validation("no private key in file").with_attr("path", path))
}

fn load_roots(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::validation(format!("bad CA certificate: {e}"))
                .with_attr("path", path))?;
    }
    Ok(roots)
}

/// Server-side acceptor from configured material.
pub fn acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_key(&tls.key_path)?;
    let builder = ServerConfig::builder();
    let config = if tls.require_client_cert {
        let ca_path = tls.ca_path.as_deref().ok_or_else(|| {
            Error::validation("require_client_cert needs a ca_path").with_attr("field", "tls.ca_path")
        })?;
        let roots = load_roots(ca_path)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::validation(format!("client verifier: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| Error::validation(format!("server TLS setup: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side connector; presents a client certificate when the peer
/// requires one.
pub fn connector(tls: &TlsConfig) -> Result<TlsConnector> {
    let roots = match tls.ca_path.as_deref() {
        Some(path) => load_roots(path)?,
        None => RootCertStore::empty(),
    };
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = if tls.require_client_cert {
        let certs = load_certs(&tls.cert_path)?;
        let key = load_key(&tls.key_path)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::validation(format!("client TLS setup: {e}")))?
    } else {
        builder.with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name for certificate validation, from a `host:port` address.
pub fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::validation("invalid TLS server name").with_attr("addr", addr))
}
