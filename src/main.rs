//! Thin CLI wiring the library to a filesystem `StorageSink`, TLS
//! certificate paths, and a credential-store passphrase so the component
//! boundaries are exercisable end-to-end. CLI ergonomics, installers, and
//! host supervision remain non-goals (§1); this binary is intentionally
//! minimal.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use xferd::audit::AuditLog;
use xferd::auth::AuthService;
use xferd::chunking::ChunkManager;
use xferd::client::tls::ServerCertPolicy;
use xferd::client::{ClientCredentials, ClientTransportMode, TransferClient};
use xferd::common::config::{AuditConfig, AuthConfig, FrameLimits, ResumeConfig, RetryConfig};
use xferd::common::model::{ChunkingPolicy, ResumeToken};
use xferd::credentials::CredentialStore;
use xferd::resume::ResumeStore;
use xferd::server::tls::ServerTlsMode;
use xferd::server::{ServerTransportMode, TransferServer};
use xferd::sinks::{FilesystemStorageSink, StorageSink};

#[derive(Parser)]
#[command(name = "xferctl")]
#[command(about = "Secure, resumable backup-transfer client/server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector: accept transfers and reassemble them under
    /// `storage_root`.
    Serve {
        #[arg(long, default_value = "0.0.0.0:9443")]
        listen: SocketAddr,
        #[arg(long)]
        cert: Option<PathBuf>,
        #[arg(long)]
        key: Option<PathBuf>,
        /// Accept plain TCP instead of TLS. Development only.
        #[arg(long)]
        insecure: bool,
        #[arg(long)]
        storage_root: PathBuf,
        #[arg(long)]
        staging_root: PathBuf,
        #[arg(long)]
        credential_store: PathBuf,
        /// Name of the environment variable holding the credential-store
        /// passphrase (minimum 16 bytes, per §4.2).
        #[arg(long, default_value = "XFERD_PASSPHRASE")]
        passphrase_env: String,
        #[arg(long)]
        audit_log: PathBuf,
        #[arg(long)]
        resume_index: PathBuf,
    },

    /// Send one file to a running collector.
    Send {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        endpoint: SocketAddr,
        #[arg(long)]
        client_id: String,
        /// Name of the environment variable holding the shared secret.
        #[arg(long, default_value = "XFERD_SECRET")]
        secret_env: String,
        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        chunk_size: u64,
        #[command(flatten)]
        tls: ClientTlsArgs,
    },

    /// Resume a previously interrupted transfer using a durable resume
    /// token obtained from a prior `send`/`resume` invocation.
    Resume {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        endpoint: SocketAddr,
        #[arg(long)]
        client_id: String,
        #[arg(long, default_value = "XFERD_SECRET")]
        secret_env: String,
        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        chunk_size: u64,
        #[arg(long)]
        resume_token: String,
        #[command(flatten)]
        tls: ClientTlsArgs,
    },

    /// Generate a self-signed certificate for local development. Never
    /// use the output in a real deployment.
    GenDevCert {
        #[arg(long, default_value = "localhost")]
        hostname: String,
        #[arg(long, default_value = "dev-cert.pem")]
        out_cert: PathBuf,
        #[arg(long, default_value = "dev-key.pem")]
        out_key: PathBuf,
    },
}

#[derive(clap::Args)]
struct ClientTlsArgs {
    #[arg(long, default_value = "localhost")]
    server_name: String,
    #[arg(long)]
    ca_bundle: Option<PathBuf>,
    #[arg(long)]
    thumbprint: Option<String>,
    /// Accept any server certificate. Development only.
    #[arg(long)]
    insecure: bool,
}

impl ClientTlsArgs {
    fn into_mode(self) -> xferd::common::error::Result<ClientTransportMode> {
        let cert_policy = if self.insecure {
            ServerCertPolicy::Insecure
        } else if let Some(sha256_hex) = self.thumbprint {
            ServerCertPolicy::ThumbprintPin { sha256_hex }
        } else if let Some(ca_bundle_path) = self.ca_bundle {
            ServerCertPolicy::FullPki { ca_bundle_path }
        } else {
            return Err(xferd::common::error::TransferError::Protocol(
                "one of --ca-bundle, --thumbprint, or --insecure is required".into(),
            ));
        };
        Ok(ClientTransportMode::Tls { server_name: self.server_name, cert_policy })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // rustls 0.23 requires a process-wide default crypto provider; with a
    // single backend feature enabled (aws_lc_rs) this still isn't implicit.
    xferd::common::ensure_crypto_provider_installed();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> xferd::common::error::Result<()> {
    match cli.command {
        Commands::Serve {
            listen,
            cert,
            key,
            insecure,
            storage_root,
            staging_root,
            credential_store,
            passphrase_env,
            audit_log,
            resume_index,
        } => {
            run_serve(
                listen,
                cert,
                key,
                insecure,
                storage_root,
                staging_root,
                credential_store,
                passphrase_env,
                audit_log,
                resume_index,
            )
            .await
        }

        Commands::Send { file, endpoint, client_id, secret_env, chunk_size, tls } => {
            run_send(file, endpoint, client_id, secret_env, chunk_size, tls, None).await
        }

        Commands::Resume { file, endpoint, client_id, secret_env, chunk_size, resume_token, tls } => {
            run_send(file, endpoint, client_id, secret_env, chunk_size, tls, Some(ResumeToken(resume_token))).await
        }

        Commands::GenDevCert { hostname, out_cert, out_key } => gen_dev_cert(hostname, out_cert, out_key).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_serve(
    listen: SocketAddr,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    insecure: bool,
    storage_root: PathBuf,
    staging_root: PathBuf,
    credential_store: PathBuf,
    passphrase_env: String,
    audit_log: PathBuf,
    resume_index: PathBuf,
) -> xferd::common::error::Result<()> {
    use xferd::common::error::TransferError;

    let passphrase = std::env::var(&passphrase_env)
        .map_err(|_| TransferError::Protocol(format!("environment variable {passphrase_env} is not set")))?;

    let credentials = Arc::new(CredentialStore::new(credential_store, passphrase.into_bytes())?);
    let audit = Arc::new(AuditLog::new(audit_log, AuditConfig::default()));
    let resume_store = ResumeStore::open(resume_index, ResumeConfig::default()).await?;
    let chunk_manager = Arc::new(ChunkManager::new(staging_root, resume_store));
    let storage: Arc<dyn StorageSink> = Arc::new(FilesystemStorageSink::new(storage_root));

    let auth = Arc::new(AuthService::new(Arc::clone(&credentials), Arc::clone(&audit), AuthConfig::default()));
    let bucket_sweep_cancel = CancellationToken::new();
    auth.spawn_background_tasks(bucket_sweep_cancel.clone());

    let transport = if insecure {
        ServerTransportMode::PlainDevelopmentOnly
    } else {
        let (cert_path, key_path) = match (cert, key) {
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(TransferError::Protocol(
                    "--cert and --key are required unless --insecure is passed".into(),
                ))
            }
        };
        ServerTransportMode::Tls(ServerTlsMode::Tls { cert_path, key_path })
    };

    let server = TransferServer::bind(
        listen,
        transport,
        auth,
        chunk_manager,
        Arc::clone(&audit),
        storage,
        FrameLimits::default(),
    )
    .await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
    });

    tracing::info!(addr = %listen, "xferd listening");
    server.run_until_cancelled().await;

    bucket_sweep_cancel.cancel();
    audit.shutdown().await;
    Ok(())
}

async fn run_send(
    file: PathBuf,
    endpoint: SocketAddr,
    client_id: String,
    secret_env: String,
    chunk_size: u64,
    tls: ClientTlsArgs,
    resume_token: Option<ResumeToken>,
) -> xferd::common::error::Result<()> {
    use xferd::common::error::TransferError;

    if !file.exists() {
        return Err(TransferError::NotFound(format!("source file {}", file.display())));
    }

    let secret = std::env::var(&secret_env)
        .map_err(|_| TransferError::Protocol(format!("environment variable {secret_env} is not set")))?
        .into_bytes();

    let transport = tls.into_mode()?;
    let client = TransferClient::new(RetryConfig::default(), transport);
    let credentials = ClientCredentials { client_id, secret };
    let policy = ChunkingPolicy::new(chunk_size);
    let cancel = CancellationToken::new();

    let result = match resume_token {
        Some(token) => client.resume(token, &file, endpoint, &credentials, policy, cancel).await,
        None => client.transfer(&file, endpoint, &credentials, policy, cancel).await,
    };

    if result.outcome.success {
        println!(
            "transferred {} bytes in {}ms",
            result.outcome.bytes_transferred, result.outcome.duration_millis
        );
        if let Some(token) = result.resume_token {
            println!("resume token: {token}");
        }
        Ok(())
    } else {
        let message = result.outcome.error_message.unwrap_or_else(|| "transfer failed".to_string());
        if let Some(token) = result.resume_token {
            eprintln!("resume token for retry: {token}");
        }
        Err(TransferError::Unavailable(message))
    }
}

async fn gen_dev_cert(hostname: String, out_cert: PathBuf, out_key: PathBuf) -> xferd::common::error::Result<()> {
    use xferd::common::error::TransferError;

    let cert = rcgen::generate_simple_self_signed(vec![hostname])
        .map_err(|e| TransferError::Internal(anyhow::anyhow!("certificate generation failed: {e}")))?;
    tokio::fs::write(&out_cert, cert.cert.pem())
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    tokio::fs::write(&out_key, cert.key_pair.serialize_pem())
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    println!("wrote {} and {}", out_cert.display(), out_key.display());
    Ok(())
}
