//! TLS acceptor construction for `TransferServer` (§4.7: TLS-first, plain
//! TCP only for explicit development builds).

use crate::common::error::{Result, TransferError};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// How a server validates its own identity to connecting clients. TLS is
/// the default; `Insecure` exists only for local development and logs a
/// warning on startup.
pub enum ServerTlsMode {
    Tls { cert_path: std::path::PathBuf, key_path: std::path::PathBuf },
    Insecure,
}

/// Builds a `TlsAcceptor` from a PEM certificate chain and PKCS#8 private
/// key on disk.
pub async fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    crate::common::ensure_crypto_provider_installed();

    let cert_bytes = tokio::fs::read(cert_path).await.map_err(|e| TransferError::Internal(e.into()))?;
    let key_bytes = tokio::fs::read(key_path).await.map_err(|e| TransferError::Internal(e.into()))?;

    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_bytes.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| TransferError::Internal(e.into()))?;

    let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut key_bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransferError::Internal(e.into()))?
        .into_iter()
        .map(PrivateKeyDer::Pkcs8)
        .collect();

    let key = keys
        .pop()
        .ok_or_else(|| TransferError::Internal(anyhow::anyhow!("no private key found in {}", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| TransferError::Internal(e.into()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
