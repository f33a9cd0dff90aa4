//! TLS material loading for the admission webhook.
//!
//! The cluster provisions `tls.crt`/`tls.key` into a mounted certificate
//! directory; this module turns them into a rustls server config. Peer
//! gRPC traffic stays in-cluster and is served without TLS.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Error type for webhook TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("no private key in {0}")]
    EmptyKey(PathBuf),

    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TLS material: {0}")]
    Build(#[from] rustls::Error),
}

/// Load a rustls server config from `<cert_dir>/tls.crt` and
/// `<cert_dir>/tls.key`. rustls only negotiates TLS 1.2 and newer.
pub async fn load_server_config(cert_dir: &Path) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let cert_path = cert_dir.join("tls.crt");
    let key_path = cert_dir.join("tls.key");

    if !cert_path.exists() {
        return Err(TlsError::CertNotFound(cert_path));
    }
    if !key_path.exists() {
        return Err(TlsError::KeyNotFound(key_path));
    }

    let cert_pem = tokio::fs::read(&cert_path).await?;
    let key_pem = tokio::fs::read(&key_path).await?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or(TlsError::EmptyKey(key_path))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
