//! Shared types, error taxonomy, and runtime configuration used by every
//! component module.

pub mod config;
pub mod error;
pub mod model;
pub mod validation;

pub use error::{Result, TransferError, TransferOutcome};

/// Installs the process-wide default `rustls` crypto provider on first
/// call. Called both from `xferctl::main` at startup and from the TLS
/// acceptor/connector constructors, so library consumers that build a
/// `TransferServer` or `TransferClient` in TLS mode without going through
/// the binary (tests, embedders) don't hit rustls's first-use panic.
pub fn ensure_crypto_provider_installed() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}
