//! Outbound counterpart to [`crate::server`] (§4.8): retries with
//! exponential backoff and resumes on reconnect.

pub mod tls;

use crate::checksum;
use crate::common::config::RetryConfig;
use crate::common::error::{Result, TransferError};
use crate::common::model::{ChunkingPolicy, FileDescriptor, ResumeToken};
use crate::common::validation;
use crate::protocol::frame::{AckFrame, AuthAckFrame, AuthFrame, ChunkAckFrame, ChunkFrame, FinalFrame, RequestFrame};
use crate::protocol::FrameCodec;
use crate::recovery::{Decision, RecoveryCoordinator};
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The shared secret a client authenticates with. Never logged.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub secret: Vec<u8>,
}

/// How the client secures (or doesn't secure) the transport. Plain TCP is
/// permitted only for explicit development use, per §4.7/§6.
pub enum ClientTransportMode {
    Tls { server_name: String, cert_policy: tls::ServerCertPolicy },
    PlainDevelopmentOnly,
}

/// Outcome of one `transfer`/`resume` call, plus the resume token the
/// server minted for this transfer (if any), so a caller can persist it
/// and retry a later interrupted transfer.
#[derive(Debug, Clone)]
pub struct ClientTransferResult {
    pub outcome: crate::common::error::TransferOutcome,
    pub resume_token: Option<ResumeToken>,
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}
type BoxedStream = Box<dyn AsyncStream>;
type ConnFramed = Framed<BoxedStream, FrameCodec>;

/// Retrying, resume-capable client.
pub struct TransferClient {
    retry: RetryConfig,
    transport: ClientTransportMode,
    recovery: RecoveryCoordinator,
}

impl TransferClient {
    pub fn new(retry: RetryConfig, transport: ClientTransportMode) -> Self {
        let recovery = RecoveryCoordinator::new(retry.clone());
        Self { retry, transport, recovery }
    }

    /// Transfers `path` to `endpoint` as a brand-new transfer. `cancel`
    /// aborts the in-flight attempt (not retried); pass
    /// `CancellationToken::new()` for an attempt that's never cancelled.
    pub async fn transfer(
        &self,
        path: &Path,
        endpoint: SocketAddr,
        credentials: &ClientCredentials,
        chunking: ChunkingPolicy,
        cancel: CancellationToken,
    ) -> ClientTransferResult {
        self.run_with_retry(path, endpoint, credentials, chunking, None, cancel).await
    }

    /// Resumes a previously interrupted transfer using a durable
    /// `ResumeToken` obtained from an earlier `transfer`/`resume` call.
    pub async fn resume(
        &self,
        resume_token: ResumeToken,
        path: &Path,
        endpoint: SocketAddr,
        credentials: &ClientCredentials,
        chunking: ChunkingPolicy,
        cancel: CancellationToken,
    ) -> ClientTransferResult {
        self.run_with_retry(path, endpoint, credentials, chunking, Some(resume_token), cancel).await
    }

    async fn run_with_retry(
        &self,
        path: &Path,
        endpoint: SocketAddr,
        credentials: &ClientCredentials,
        chunking: ChunkingPolicy,
        mut resume_token: Option<ResumeToken>,
        cancel: CancellationToken,
    ) -> ClientTransferResult {
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 1..=self.retry.max_retries.max(1) {
            if cancel.is_cancelled() {
                last_error = Some(TransferError::Transport("attempt cancelled".into()));
                break;
            }
            let mut minted_token: Option<ResumeToken> = None;
            let attempt_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Transport("attempt cancelled".into())),
                result = self.attempt_once(path, endpoint, credentials, chunking, resume_token.clone(), &mut minted_token, &cancel) => result,
            };

            // `minted_token` is set as soon as the initial ack is parsed,
            // before any chunk I/O that could fail with `?` — so it's
            // populated here even when `attempt_result` is an `Err`.
            if minted_token.is_some() {
                resume_token = minted_token.clone();
            }

            match attempt_result {
                Ok(bytes_transferred) => {
                    return ClientTransferResult {
                        outcome: crate::common::error::TransferOutcome::ok(
                            bytes_transferred,
                            started.elapsed().as_millis() as u64,
                        ),
                        resume_token,
                    };
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        // Cancellation mid-attempt is never retried.
                        last_error = Some(e);
                        break;
                    }
                    let decision = self.recovery.decide(&e, resume_token.is_some());
                    warn!(attempt, error = %e, ?decision, "transfer attempt failed");
                    let retryable = matches!(decision, Decision::RetryWithBackoff) && attempt < self.retry.max_retries;
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    tokio::time::sleep(self.retry.backoff_for_attempt(attempt)).await;
                }
            }
        }

        let err = last_error.unwrap_or(TransferError::Internal(anyhow::anyhow!("no attempt was made")));
        ClientTransferResult {
            outcome: crate::common::error::TransferOutcome::failed(&err, 0, started.elapsed().as_millis() as u64),
            resume_token,
        }
    }

    /// Runs one connect-authenticate-transfer-finalize attempt. Whatever
    /// resume token the server mints on its initial ack is written to
    /// `minted_token` immediately, before any chunk I/O runs — so a caller
    /// observes it even when this function returns early via `?` on a
    /// later I/O error.
    async fn attempt_once(
        &self,
        path: &Path,
        endpoint: SocketAddr,
        credentials: &ClientCredentials,
        chunking: ChunkingPolicy,
        resume_token: Option<ResumeToken>,
        minted_token: &mut Option<ResumeToken>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let (md5, sha256, size) = checksum::digest_file(path).await?;
        let logical_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::Protocol("source path has no file name".into()))?;
        validation::validate_logical_name(logical_name)
            .map_err(|e| TransferError::Protocol(e.to_string()))?;

        let descriptor = FileDescriptor {
            logical_name: logical_name.to_string(),
            size,
            md5: Some(md5),
            sha256: Some(sha256),
            created_at: Utc::now(),
            source_tag: None,
        };

        let stream = self.connect(endpoint, cancel).await?;
        let codec = FrameCodec::new(crate::protocol::DEFAULT_CHUNK_FRAME_LIMIT);
        let mut framed = Framed::new(stream, codec);

        let token_id = self.authenticate(&mut framed, credentials).await?;

        let transfer_id = Uuid::new_v4().to_string();
        let request = RequestFrame {
            transfer_id: transfer_id.clone(),
            metadata: descriptor.clone(),
            chunking_strategy: chunking,
            resume_transfer: resume_token.is_some(),
            resume_token: resume_token.as_ref().map(|t| t.as_str().to_string()),
            auth_token: token_id,
        };
        send_json_frame(&mut framed, &request).await?;

        let ack = read_json_frame::<AckFrame>(&mut framed).await?;
        if !ack.success {
            return Err(TransferError::Protocol(
                ack.error_message.unwrap_or_else(|| "request rejected".into()),
            ));
        }

        let (already_completed, parsed_minted_token) = parse_ack_additional_info(&ack);
        *minted_token = parsed_minted_token;

        if chunking.is_direct(size) {
            let mut file = tokio::fs::File::open(path).await.map_err(|e| TransferError::Internal(e.into()))?;
            let mut buf = vec![0u8; size as usize];
            file.read_exact(&mut buf).await.map_err(|e| TransferError::Internal(e.into()))?;
            let stream = framed.get_mut();
            stream
                .write_all(&buf)
                .await
                .map_err(|e| TransferError::Transport(e.to_string()))?;
        } else {
            self.send_chunks(&mut framed, path, &transfer_id, chunking, size, &already_completed).await?;
        }

        let final_frame = read_json_frame::<FinalFrame>(&mut framed).await?;
        if !final_frame.success {
            return Err(TransferError::Integrity {
                expected: "descriptor digest".into(),
                actual: final_frame.error_message.unwrap_or_else(|| "finalize failed".into()),
            });
        }

        info!(transfer_id, bytes = size, "transfer finished");
        Ok(size)
    }

    async fn connect(&self, endpoint: SocketAddr, _cancel: &CancellationToken) -> Result<BoxedStream> {
        let tcp = self
            .recovery
            .with_deadline("tcp-connect", self.retry.connect_timeout, async {
                TcpStream::connect(endpoint)
                    .await
                    .map_err(|e| TransferError::Transport(e.to_string()))
            })
            .await?;
        tcp.set_nodelay(true).ok();

        match &self.transport {
            ClientTransportMode::PlainDevelopmentOnly => Ok(Box::new(tcp)),
            ClientTransportMode::Tls { server_name, cert_policy } => {
                let connector = tls::build_connector(cert_policy).await?;
                let name = rustls::pki_types::ServerName::try_from(server_name.clone())
                    .map_err(|e| TransferError::Protocol(format!("invalid server name {server_name}: {e}")))?;
                let tls_stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| TransferError::Transport(format!("TLS handshake failed: {e}")))?;
                Ok(Box::new(tls_stream))
            }
        }
    }

    async fn authenticate(&self, framed: &mut ConnFramed, credentials: &ClientCredentials) -> Result<String> {
        let auth_frame = AuthFrame {
            client_id: credentials.client_id.clone(),
            secret: base64::engine::general_purpose::STANDARD.encode(&credentials.secret),
            request_timestamp: Utc::now(),
        };
        send_json_frame(framed, &auth_frame).await?;
        let ack = read_json_frame::<AuthAckFrame>(framed).await?;
        if !ack.success {
            return Err(TransferError::Auth);
        }
        ack.token_id.ok_or_else(|| TransferError::Protocol("auth ack missing tokenId".into()))
    }

    async fn send_chunks(
        &self,
        framed: &mut ConnFramed,
        path: &Path,
        transfer_id: &str,
        policy: ChunkingPolicy,
        size: u64,
        already_completed: &BTreeSet<u64>,
    ) -> Result<()> {
        let chunk_count = policy.chunk_count(size);
        let mut file = tokio::fs::File::open(path).await.map_err(|e| TransferError::Internal(e.into()))?;

        let pending: Vec<u64> = (0..chunk_count).filter(|i| !already_completed.contains(i)).collect();

        for (pos, &index) in pending.iter().enumerate() {
            let offset = index * policy.chunk_size;
            let len = policy.chunk_len(size, index) as usize;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::Internal(e.into()))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await.map_err(|e| TransferError::Internal(e.into()))?;

            let is_last_chunk = pos == pending.len() - 1;
            let checksum = checksum::digest_buffer(&buf);

            let mut retried = false;
            loop {
                let chunk_frame = ChunkFrame {
                    transfer_id: transfer_id.to_string(),
                    chunk_index: index,
                    data: base64::engine::general_purpose::STANDARD.encode(&buf),
                    chunk_checksum: Some(checksum.clone()),
                    is_last_chunk,
                };
                send_json_frame(framed, &chunk_frame).await?;
                let chunk_ack = read_json_frame::<ChunkAckFrame>(framed).await?;
                if chunk_ack.success {
                    break;
                }
                debug!(chunk_index = index, retried, "chunk rejected by server");
                if retried {
                    return Err(TransferError::Checksum { chunk_index: index });
                }
                retried = true;
            }
        }
        Ok(())
    }
}

fn parse_ack_additional_info(ack: &AckFrame) -> (BTreeSet<u64>, Option<ResumeToken>) {
    let Some(value) = &ack.additional_info else {
        return (BTreeSet::new(), None);
    };
    if let Some(array) = value.as_array() {
        let completed = array.iter().filter_map(|v| v.as_u64()).collect();
        return (completed, None);
    }
    if let Some(token) = value.get("resumeToken").and_then(|v| v.as_str()) {
        return (BTreeSet::new(), Some(ResumeToken(token.to_string())));
    }
    (BTreeSet::new(), None)
}

async fn send_json_frame<T: serde::Serialize>(framed: &mut ConnFramed, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value).map_err(|e| TransferError::Internal(e.into()))?;
    framed
        .send(Bytes::from(body))
        .await
        .map_err(|e| TransferError::Transport(e.to_string()))
}

async fn read_json_frame<T: serde::de::DeserializeOwned>(framed: &mut ConnFramed) -> Result<T> {
    let bytes = framed
        .next()
        .await
        .ok_or_else(|| TransferError::Transport("connection closed before frame received".into()))?
        .map_err(|e| TransferError::Transport(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TransferError::Protocol(format!("malformed frame: {e}")))
}
