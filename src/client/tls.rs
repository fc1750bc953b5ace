//! Client-side TLS handshake policy (§4.8): full PKI validation,
//! thumbprint pinning, or an explicit insecure mode for development.

use crate::common::error::{Result, TransferError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::warn;

/// How a client validates the server's certificate. Stated explicitly by
/// the caller — there's no implicit default, per §4.8.
pub enum ServerCertPolicy {
    /// Standard chain-of-trust validation against a CA bundle.
    FullPki { ca_bundle_path: std::path::PathBuf },
    /// Accept only a certificate whose SHA-256 fingerprint matches exactly,
    /// skipping chain validation. For pinned deployments without a shared CA.
    ThumbprintPin { sha256_hex: String },
    /// Accept any certificate. Development only; logs a warning on every
    /// handshake.
    Insecure,
}

pub async fn build_connector(policy: &ServerCertPolicy) -> Result<TlsConnector> {
    crate::common::ensure_crypto_provider_installed();

    let config = match policy {
        ServerCertPolicy::FullPki { ca_bundle_path } => build_full_pki_config(ca_bundle_path).await?,
        ServerCertPolicy::ThumbprintPin { sha256_hex } => build_pinned_config(sha256_hex)?,
        ServerCertPolicy::Insecure => {
            warn!("TLS server certificate validation disabled; this mode is for development only");
            build_insecure_config()
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn build_full_pki_config(ca_bundle_path: &Path) -> Result<ClientConfig> {
    let pem = tokio::fs::read(ca_bundle_path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| TransferError::Internal(e.into()))?;
        roots
            .add(cert)
            .map_err(|e| TransferError::Internal(anyhow::anyhow!("invalid CA certificate: {e}")))?;
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn build_pinned_config(sha256_hex: &str) -> Result<ClientConfig> {
    let expected = hex::decode(sha256_hex)
        .map_err(|e| TransferError::Internal(anyhow::anyhow!("invalid thumbprint hex: {e}")))?;
    if expected.len() != 32 {
        return Err(TransferError::Internal(anyhow::anyhow!(
            "thumbprint must be a 32-byte SHA-256 digest, got {} bytes",
            expected.len()
        )));
    }
    let verifier = Arc::new(ThumbprintVerifier { expected_sha256: expected });
    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

fn build_insecure_config() -> ClientConfig {
    let verifier = Arc::new(AcceptAnyVerifier);
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth()
}

#[derive(Debug)]
struct ThumbprintVerifier {
    expected_sha256: Vec<u8>,
}

impl ServerCertVerifier for ThumbprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let actual = Sha256::digest(end_entity.as_ref());
        if actual.as_slice() == self.expected_sha256.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate thumbprint did not match the pinned value".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn request_scts(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct AcceptAnyVerifier;

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn request_scts(&self) -> bool {
        false
    }
}
