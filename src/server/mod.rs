//! TLS-first TCP listener (§4.7): accepts connections, authenticates and
//! drives each one through [`connection::handle_connection`] on its own
//! task, and joins every live handler on shutdown within a bounded grace
//! period.

pub mod connection;
pub mod tls;

use crate::audit::AuditLog;
use crate::auth::AuthService;
use crate::chunking::ChunkManager;
use crate::common::config::{FrameLimits, RetryConfig};
use crate::common::error::{Result, TransferError};
use crate::recovery::RecoveryCoordinator;
use crate::sinks::StorageSink;
use connection::{BoxedStream, ConnectionContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How the listener secures accepted connections. Plain TCP is permitted
/// only for explicit development builds, per §4.7/§6.
pub enum ServerTransportMode {
    Tls(tls::ServerTlsMode),
    PlainDevelopmentOnly,
}

/// Which upgrade path an accepted connection takes, precomputed once at
/// bind time rather than re-read from disk on every connection.
enum Upgrade {
    Plain,
    Tls(tokio_rustls::TlsAcceptor),
}

/// A TLS-first TCP listener that authenticates and services one
/// `TransferSession` per accepted connection.
pub struct TransferServer {
    listener: TcpListener,
    upgrade: Upgrade,
    ctx: Arc<ConnectionContext>,
    shutdown_grace: std::time::Duration,
    cancel: CancellationToken,
    handlers: Mutex<tokio::task::JoinSet<()>>,
}

impl TransferServer {
    /// Binds `addr` and assembles the capabilities every connection
    /// handler needs. Does not start accepting until [`Self::run_until_cancelled`]
    /// is called.
    pub async fn bind(
        addr: SocketAddr,
        transport: ServerTransportMode,
        auth: Arc<AuthService>,
        chunk_manager: Arc<ChunkManager>,
        audit: Arc<AuditLog>,
        storage: Arc<dyn StorageSink>,
        frame_limits: FrameLimits,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransferError::Internal(e.into()))?;

        let upgrade = match &transport {
            ServerTransportMode::PlainDevelopmentOnly => {
                warn!(%addr, "listening on plain TCP; this mode is for development only");
                Upgrade::Plain
            }
            ServerTransportMode::Tls(tls::ServerTlsMode::Insecure) => {
                warn!("TLS disabled via ServerTlsMode::Insecure; accepting plain TCP");
                Upgrade::Plain
            }
            ServerTransportMode::Tls(tls::ServerTlsMode::Tls { cert_path, key_path }) => {
                Upgrade::Tls(tls::build_acceptor(cert_path, key_path).await?)
            }
        };

        Ok(Self {
            listener,
            upgrade,
            ctx: Arc::new(ConnectionContext {
                auth,
                chunk_manager,
                audit,
                storage,
                frame_limits,
                recovery: Arc::new(RecoveryCoordinator::new(RetryConfig::default())),
            }),
            shutdown_grace: crate::common::config::SHUTDOWN_GRACE,
            cancel: CancellationToken::new(),
            handlers: Mutex::new(tokio::task::JoinSet::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| TransferError::Internal(e.into()))
    }

    /// A token that, when cancelled, makes [`Self::run_until_cancelled`]
    /// stop accepting and begin the graceful-shutdown join.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accepts connections until `self.shutdown_handle()` is cancelled,
    /// spawning one task per connection, then joins every in-flight
    /// handler with a bounded grace period (default 30s, §4.7/§5).
    pub async fn run_until_cancelled(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((tcp, peer_addr)) => self.spawn_connection(tcp, peer_addr).await,
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }
        self.join_with_grace().await;
    }

    async fn spawn_connection(&self, tcp: TcpStream, peer_addr: SocketAddr) {
        tcp.set_nodelay(true).ok();
        let ctx = Arc::clone(&self.ctx);

        match self.upgrade_stream(tcp).await {
            Ok(stream) => {
                let mut handlers = self.handlers.lock().await;
                handlers.spawn(async move {
                    connection::handle_connection(stream, peer_addr, ctx).await;
                });
            }
            Err(e) => {
                warn!(%peer_addr, error = %e, "TLS handshake failed");
            }
        }
    }

    async fn upgrade_stream(&self, tcp: TcpStream) -> Result<BoxedStream> {
        match &self.upgrade {
            Upgrade::Plain => Ok(Box::new(tcp)),
            Upgrade::Tls(acceptor) => {
                let tls_stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| TransferError::Transport(format!("TLS handshake failed: {e}")))?;
                Ok(Box::new(tls_stream))
            }
        }
    }

    async fn join_with_grace(&self) {
        let mut handlers = self.handlers.lock().await;
        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                next = handlers.join_next() => {
                    match next {
                        Some(Ok(())) => continue,
                        Some(Err(e)) => {
                            error!(error = %e, "connection handler panicked");
                            continue;
                        }
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    warn!(remaining = handlers.len(), "shutdown grace period elapsed; abandoning live connections");
                    handlers.shutdown().await;
                    break;
                }
            }
        }
        info!("transfer server shut down");
    }
}
