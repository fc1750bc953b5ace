//! Per-connection state machine (§4.7):
//! `ACCEPT -> TLS_HANDSHAKE -> AWAIT_REQUEST -> AUTHORIZE -> SEND_ACK ->
//! INGEST -> FINALIZE -> SEND_FINAL -> CLOSE`, with any state able to fall
//! through to `FAIL`.

use crate::audit::AuditLog;
use crate::auth::AuthService;
use crate::chunking::ChunkManager;
use crate::common::config::FrameLimits;
use crate::common::error::{Result, TransferError};
use crate::common::model::{AuditEvent, AuditOperation, AuditOutcome};
use crate::protocol::frame::{
    AckFrame, AuthAckFrame, AuthFrame, ChunkAckFrame, ChunkFrame, FinalFrame, RequestFrame,
};
use crate::protocol::FrameCodec;
use crate::recovery::{Decision, RecoveryCoordinator};
use crate::sinks::StorageSink;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Capabilities a connection handler needs; bundled so `TransferServer`
/// can hand one `Arc` to every spawned task.
pub struct ConnectionContext {
    pub auth: Arc<AuthService>,
    pub chunk_manager: Arc<ChunkManager>,
    pub audit: Arc<AuditLog>,
    pub storage: Arc<dyn StorageSink>,
    pub frame_limits: FrameLimits,
    pub recovery: Arc<RecoveryCoordinator>,
}

/// Whether a fault observed mid-transfer should preserve staging state for
/// a later resume, per the §4.9 decision table (`Surface` means no resume
/// is possible; anything else means a reconnect could still recover).
fn is_retriable(ctx: &ConnectionContext, error: &TransferError) -> bool {
    !matches!(ctx.recovery.decide(error, true), Decision::Surface)
}

/// Blanket marker so the handler can take either a TLS or plain stream as
/// a single boxed type.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// The connection stream, type-erased so the listener loop doesn't need to
/// carry the TLS/plain distinction past accept time.
pub type BoxedStream = Box<dyn AsyncStream>;
type ConnFramed = Framed<BoxedStream, FrameCodec>;

pub async fn handle_connection(stream: BoxedStream, peer_addr: SocketAddr, ctx: Arc<ConnectionContext>) {
    let started = std::time::Instant::now();
    match run(stream, ctx.clone()).await {
        Ok(transfer_id) => {
            info!(%peer_addr, transfer_id, elapsed_ms = started.elapsed().as_millis() as u64, "transfer completed");
        }
        Err(e) => {
            warn!(%peer_addr, error = %e, "connection failed");
        }
    }
}

async fn run(stream: BoxedStream, ctx: Arc<ConnectionContext>) -> Result<String> {
    let codec = crate::protocol::FrameCodec::new(ctx.frame_limits.max_chunk_frame as usize);
    let mut framed = Framed::new(stream, codec);

    // AUTH_EXCHANGE: the client mints the AuthToken it will quote in the
    // request frame's `authToken` field on this same connection.
    let auth_frame = read_json_frame::<AuthFrame>(&mut framed, ctx.frame_limits.max_control_frame as usize).await?;
    let secret = base64::engine::general_purpose::STANDARD
        .decode(&auth_frame.secret)
        .map_err(|e| TransferError::Protocol(format!("invalid base64 secret: {e}")))?;
    match ctx
        .auth
        .authenticate(&auth_frame.client_id, &secret, auth_frame.request_timestamp)
        .await
    {
        Ok((token_id, expires_at, _permissions)) => {
            send_json_frame(&mut framed, &AuthAckFrame::ok(token_id, expires_at)).await?;
        }
        Err(e) => {
            send_json_frame(&mut framed, &AuthAckFrame::failure("invalid credentials")).await.ok();
            return Err(e);
        }
    }

    // AWAIT_REQUEST
    let request = read_json_frame::<RequestFrame>(&mut framed, ctx.frame_limits.max_control_frame as usize).await?;

    // AUTHORIZE
    let authorize_result = ctx.auth.introspect(&request.auth_token).await;
    if let Err(e) = &authorize_result {
        send_ack(&mut framed, AckFrame::failure("authorization failed")).await.ok();
        log_transfer_event(&ctx, &request.transfer_id, AuditOperation::TransferBegin, AuditOutcome::Failure).await;
        return Err(clone_auth_error(e));
    }

    if !ctx.storage.has_space(request.metadata.size).await? {
        send_ack(&mut framed, AckFrame::failure("insufficient storage")).await.ok();
        return Err(TransferError::StorageFull);
    }

    let policy = request.chunking_strategy;
    let (transfer_id, already_completed, minted_resume_token) = if request.resume_transfer {
        let token = request
            .resume_token
            .clone()
            .map(crate::common::model::ResumeToken)
            .ok_or_else(|| TransferError::Protocol("resumeTransfer set without resumeToken".into()))?;
        let id = ctx
            .chunk_manager
            .restore(&token, request.metadata.clone(), policy)
            .await?;
        let (_, completed) = ctx.chunk_manager.resume_info(&token)?;
        (id, completed, None)
    } else {
        let id = ctx.chunk_manager.begin(request.metadata.clone(), policy).await?;
        // Mint the resume handle up front and hand it back on the initial
        // ack so a later reconnect can use it — the only point in the
        // protocol where the client learns this transfer's resume token.
        let token = ctx.chunk_manager.mint_resume(&id).await?;
        (id, Default::default(), Some(token))
    };

    // SEND_ACK
    let completed_vec: Vec<u64> = already_completed.iter().copied().collect();
    let ack = match (minted_resume_token, completed_vec.is_empty()) {
        (Some(token), _) => AckFrame::ok_with_resume_token(&token),
        (None, false) => AckFrame::ok_with_completed_chunks(&completed_vec),
        (None, true) => AckFrame::ok(),
    };
    send_ack(&mut framed, ack).await?;

    // INGEST
    let ingest_result = if policy.is_direct(request.metadata.size) {
        ingest_direct(&mut framed, &ctx, &transfer_id, request.metadata.size).await
    } else {
        ingest_chunked(&mut framed, &ctx, &transfer_id, already_completed.iter().copied().max()).await
    };
    if let Err(e) = ingest_result {
        // §4.9 "Cleanup on error": a non-retriable fault wipes staging and
        // the resume entry; a retriable one (timeout, transport reset, a
        // single bad chunk checksum) leaves them for a later reconnect.
        ctx.chunk_manager.abort(&transfer_id, is_retriable(&ctx, &e)).await;
        return Err(e);
    }

    // FINALIZE
    let target_path = match ctx.storage.target_path(&request.metadata).await {
        Ok(path) => path,
        Err(e) => {
            ctx.chunk_manager.abort(&transfer_id, is_retriable(&ctx, &e)).await;
            return Err(e);
        }
    };
    let final_result = ctx.chunk_manager.finalize(&transfer_id, Some(target_path)).await;

    // SEND_FINAL
    match &final_result {
        Ok(path) => {
            send_json_frame(&mut framed, &FinalFrame::ok(path.display().to_string())).await.ok();
            log_transfer_event(&ctx, &transfer_id, AuditOperation::Finalize, AuditOutcome::Success).await;
        }
        Err(e) => {
            send_json_frame(&mut framed, &FinalFrame::failure(e.to_string())).await.ok();
            log_transfer_event(&ctx, &transfer_id, AuditOperation::Finalize, AuditOutcome::Failure).await;
            // `finalize` only removes the session on success; a failed
            // finalize (e.g. a whole-file digest mismatch) otherwise leaves
            // the session and staging directory behind forever.
            ctx.chunk_manager.abort(&transfer_id, is_retriable(&ctx, e)).await;
        }
    }

    final_result.map(|_| transfer_id)
}

async fn ingest_direct(
    framed: &mut ConnFramed,
    ctx: &Arc<ConnectionContext>,
    transfer_id: &str,
    size: u64,
) -> Result<()> {
    let stream = framed.get_mut();
    let mut buf = vec![0u8; size as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransferError::Transport(format!("premature EOF on direct transfer: {e}")))?;
    ctx.chunk_manager.ingest(transfer_id, 0, &buf, None, true).await?;
    Ok(())
}

async fn ingest_chunked(
    framed: &mut ConnFramed,
    ctx: &Arc<ConnectionContext>,
    transfer_id: &str,
    resume_floor: Option<u64>,
) -> Result<()> {
    let mut last_accepted: Option<u64> = resume_floor;
    loop {
        let chunk = read_json_frame::<ChunkFrame>(framed, ctx.frame_limits.max_chunk_frame as usize).await?;

        if let Some(last) = last_accepted {
            if chunk.chunk_index <= last {
                send_json_frame(
                    framed,
                    &ChunkAckFrame::failure(chunk.chunk_index, "chunk index out of order"),
                )
                .await
                .ok();
                return Err(TransferError::Order {
                    expected: last + 1,
                    got: chunk.chunk_index,
                });
            }
        }

        let data = base64::engine::general_purpose::STANDARD
            .decode(&chunk.data)
            .map_err(|e| TransferError::Protocol(format!("invalid base64 chunk payload: {e}")))?;

        let outcome = match ctx
            .chunk_manager
            .ingest(transfer_id, chunk.chunk_index, &data, chunk.chunk_checksum.as_deref(), chunk.is_last_chunk)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                send_json_frame(framed, &ChunkAckFrame::failure(chunk.chunk_index, e.to_string())).await.ok();
                return Err(e);
            }
        };

        send_json_frame(framed, &ChunkAckFrame::ok(outcome.chunk_index)).await?;
        last_accepted = Some(chunk.chunk_index);

        if chunk.is_last_chunk {
            break;
        }
    }
    Ok(())
}

async fn read_json_frame<T: serde::de::DeserializeOwned, S: AsyncStream + ?Sized>(
    framed: &mut Framed<Box<S>, FrameCodec>,
    limit: usize,
) -> Result<T> {
    let bytes = framed
        .next()
        .await
        .ok_or_else(|| TransferError::Transport("connection closed before frame received".into()))?
        .map_err(|e| TransferError::Transport(e.to_string()))?;
    if bytes.len() > limit {
        return Err(TransferError::Protocol(format!(
            "frame of {} bytes exceeds limit of {limit} bytes",
            bytes.len()
        )));
    }
    serde_json::from_slice(&bytes).map_err(|e| TransferError::Protocol(format!("malformed frame: {e}")))
}

async fn send_json_frame<T: serde::Serialize, S: AsyncStream + ?Sized>(
    framed: &mut Framed<Box<S>, FrameCodec>,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec(value).map_err(|e| TransferError::Internal(e.into()))?;
    framed
        .send(Bytes::from(body))
        .await
        .map_err(|e| TransferError::Transport(e.to_string()))
}

async fn send_ack<S: AsyncStream + ?Sized>(framed: &mut Framed<Box<S>, FrameCodec>, ack: AckFrame) -> Result<()> {
    send_json_frame(framed, &ack).await
}

fn clone_auth_error(err: &TransferError) -> TransferError {
    match err {
        TransferError::TokenExpired => TransferError::TokenExpired,
        _ => TransferError::Auth,
    }
}

async fn log_transfer_event(ctx: &Arc<ConnectionContext>, transfer_id: &str, operation: AuditOperation, outcome: AuditOutcome) {
    ctx.audit
        .log_event(AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            client_id: None,
            operation,
            outcome,
            error_code: None,
            error_message: None,
            source_address: None,
            duration_millis: 0,
        })
        .await;
    let _ = transfer_id;
}
