//! Shared fixtures for the integration tests: spins up a full
//! `TransferServer` over plain TCP (no certificates to manage in tests)
//! backed by real `CredentialStore`/`AuditLog`/`ChunkManager`/`ResumeStore`
//! instances rooted in a `TempDir`.

use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use xferd::protocol::frame::ChunkFrame;
use xferd::protocol::{FrameCodec, DEFAULT_CHUNK_FRAME_LIMIT};
use xferd::audit::AuditLog;
use xferd::auth::AuthService;
use xferd::chunking::ChunkManager;
use xferd::common::config::{AuditConfig, AuthConfig, FrameLimits};
use xferd::common::model::ClientRecord;
use xferd::credentials::CredentialStore;
use xferd::resume::ResumeStore;
use xferd::server::{ServerTransportMode, TransferServer};
use xferd::sinks::{FilesystemStorageSink, StorageSink};

pub const CLIENT_ID: &str = "test-client-123";
pub const CLIENT_SECRET: &[u8] = b"correct-horse-battery-staple";

pub struct Harness {
    pub addr: SocketAddr,
    pub storage_root: std::path::PathBuf,
    _dir: TempDir,
    cancel: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.server_task.abort();
    }
}

/// Same salted-SHA-256 scheme `AuthService` hashes secrets with
/// (internal, so the harness reproduces it to seed a `ClientRecord`).
fn hash_secret(secret: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().to_vec()
}

/// Boots a full server stack on an ephemeral port with one registered
/// client (`CLIENT_ID` / `CLIENT_SECRET`), over plain TCP.
pub async fn start_server() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage_root = dir.path().join("storage");
    let staging_root = dir.path().join("staging");
    tokio::fs::create_dir_all(&storage_root).await.unwrap();
    tokio::fs::create_dir_all(&staging_root).await.unwrap();

    let credentials = Arc::new(
        CredentialStore::new(dir.path().join("creds.bin"), b"a very secret passphrase!!".to_vec()).unwrap(),
    );
    let salt = b"test-salt-bytes".to_vec();
    credentials
        .put(ClientRecord {
            client_id: CLIENT_ID.to_string(),
            secret_hash: hash_secret(CLIENT_SECRET, &salt),
            salt,
            display_name: "integration test client".into(),
            permissions: BTreeSet::from(["transfer".to_string()]),
            active: true,
            created_at: chrono::Utc::now(),
            expires_at: None,
            generation: 0,
        })
        .await
        .unwrap();

    let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl"), AuditConfig::default()));
    let resume_store = ResumeStore::open(dir.path().join("resume.json"), Default::default())
        .await
        .unwrap();
    let chunk_manager = Arc::new(ChunkManager::new(staging_root, resume_store));
    let storage: Arc<dyn StorageSink> = Arc::new(FilesystemStorageSink::new(storage_root.clone()));
    let auth = Arc::new(AuthService::new(Arc::clone(&credentials), Arc::clone(&audit), AuthConfig::default()));

    let server = TransferServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        ServerTransportMode::PlainDevelopmentOnly,
        auth,
        chunk_manager,
        audit,
        storage,
        FrameLimits::default(),
    )
    .await
    .unwrap();

    let addr = server.local_addr().unwrap();
    let cancel = server.shutdown_handle();
    let server_task = tokio::spawn(async move {
        server.run_until_cancelled().await;
    });

    Harness { addr, storage_root, _dir: dir, cancel, server_task }
}

/// Writes `size` bytes of deterministic pseudo-random content to `path`.
pub async fn write_random_file(path: &std::path::Path, size: usize) {
    let mut buf = vec![0u8; size];
    let mut state: u32 = 0x1234_5678;
    for byte in buf.iter_mut() {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *byte = (state >> 24) as u8;
    }
    tokio::fs::write(path, &buf).await.unwrap();
}

/// Drives the wire protocol directly (bypassing [`xferd::client::TransferClient`])
/// to upload only the first `chunks_to_send` chunks of `path`, then drops the
/// connection without sending a final chunk — simulating scenario 3 of §8, a
/// network drop mid-transfer. Returns the resume token the server minted on
/// the initial ack.
pub async fn send_partial_upload(
    addr: SocketAddr,
    path: &std::path::Path,
    policy: xferd::common::model::ChunkingPolicy,
    chunks_to_send: u64,
) -> xferd::common::model::ResumeToken {
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    use tokio::net::TcpStream;
    use xferd::common::model::{FileDescriptor, ResumeToken};
    use xferd::protocol::frame::{AckFrame, AuthAckFrame, AuthFrame, ChunkAckFrame, RequestFrame};

    async fn send<T: serde::Serialize>(framed: &mut Framed<TcpStream, FrameCodec>, value: &T) {
        let body = serde_json::to_vec(value).unwrap();
        framed.send(bytes::Bytes::from(body)).await.unwrap();
    }

    async fn recv<T: serde::de::DeserializeOwned>(framed: &mut Framed<TcpStream, FrameCodec>) -> T {
        let bytes = framed.next().await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    let (md5, sha256, size) = xferd::checksum::digest_file(path).await.unwrap();
    let logical_name = path.file_name().unwrap().to_str().unwrap().to_string();
    let descriptor = FileDescriptor {
        logical_name,
        size,
        md5: Some(md5),
        sha256: Some(sha256),
        created_at: chrono::Utc::now(),
        source_tag: None,
    };

    let tcp = TcpStream::connect(addr).await.unwrap();
    let codec = FrameCodec::new(DEFAULT_CHUNK_FRAME_LIMIT);
    let mut framed = Framed::new(tcp, codec);

    let auth_frame = AuthFrame {
        client_id: CLIENT_ID.to_string(),
        secret: base64::engine::general_purpose::STANDARD.encode(CLIENT_SECRET),
        request_timestamp: chrono::Utc::now(),
    };
    send(&mut framed, &auth_frame).await;
    let auth_ack: AuthAckFrame = recv(&mut framed).await;
    assert!(auth_ack.success);

    let transfer_id = uuid::Uuid::new_v4().to_string();
    let request = RequestFrame {
        transfer_id: transfer_id.clone(),
        metadata: descriptor,
        chunking_strategy: policy,
        resume_transfer: false,
        resume_token: None,
        auth_token: auth_ack.token_id.unwrap(),
    };
    send(&mut framed, &request).await;
    let ack: AckFrame = recv(&mut framed).await;
    assert!(ack.success);

    let resume_token = ack
        .additional_info
        .as_ref()
        .and_then(|v| v.get("resumeToken"))
        .and_then(|v| v.as_str())
        .map(|s| ResumeToken(s.to_string()))
        .expect("server should mint a resume token on the initial ack");

    let mut file = tokio::fs::File::open(path).await.unwrap();
    for index in 0..chunks_to_send {
        let offset = index * policy.chunk_size;
        let len = policy.chunk_len(size, index) as usize;
        file.seek(std::io::SeekFrom::Start(offset)).await.unwrap();
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await.unwrap();
        let checksum = xferd::checksum::digest_buffer(&buf);
        let chunk = ChunkFrame {
            transfer_id: transfer_id.clone(),
            chunk_index: index,
            data: base64::engine::general_purpose::STANDARD.encode(&buf),
            chunk_checksum: Some(checksum),
            is_last_chunk: false,
        };
        send(&mut framed, &chunk).await;
        let chunk_ack: ChunkAckFrame = recv(&mut framed).await;
        assert!(chunk_ack.success);
    }

    drop(framed);
    resume_token
}

/// A TCP proxy that sits in front of a real server and, on its first
/// accepted connection only, forwards exactly `cut_after_frames` server→client
/// frames before severing both directions — simulating a mid-transfer
/// network drop (§8 scenario 3) without disturbing the server's own state.
/// Every later connection is forwarded transparently. Every `ChunkFrame`
/// observed heading toward the server (on any connection) has its index
/// recorded into `seen_chunk_indices`, so a test can assert a chunk wasn't
/// retransmitted after a reconnect.
pub async fn spawn_flaky_proxy(
    target: SocketAddr,
    cut_after_frames: usize,
    seen_chunk_indices: Arc<Mutex<Vec<u64>>>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_count = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((client_sock, _)) = listener.accept().await else { break };
            let is_first = accept_count.fetch_add(1, Ordering::SeqCst) == 0;
            let seen = Arc::clone(&seen_chunk_indices);
            tokio::spawn(relay_one_connection(client_sock, target, is_first.then_some(cut_after_frames), seen));
        }
    });

    addr
}

async fn relay_one_connection(
    client_sock: tokio::net::TcpStream,
    target: SocketAddr,
    cut_after_frames: Option<usize>,
    seen_chunk_indices: Arc<Mutex<Vec<u64>>>,
) {
    let Ok(server_sock) = tokio::net::TcpStream::connect(target).await else { return };

    let client_framed = Framed::new(client_sock, FrameCodec::new(DEFAULT_CHUNK_FRAME_LIMIT));
    let server_framed = Framed::new(server_sock, FrameCodec::new(DEFAULT_CHUNK_FRAME_LIMIT));
    let (mut client_sink, mut client_stream) = client_framed.split();
    let (mut server_sink, mut server_stream) = server_framed.split();

    let cancel = CancellationToken::new();
    let c2s_cancel = cancel.clone();
    let c2s = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = c2s_cancel.cancelled() => break,
                frame = client_stream.next() => {
                    let Some(Ok(bytes)) = frame else { break };
                    if let Ok(chunk) = serde_json::from_slice::<ChunkFrame>(&bytes) {
                        seen_chunk_indices.lock().unwrap().push(chunk.chunk_index);
                    }
                    if server_sink.send(bytes.freeze()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut forwarded = 0usize;
    loop {
        let Some(Ok(bytes)) = server_stream.next().await else { break };
        if client_sink.send(bytes.freeze()).await.is_err() {
            break;
        }
        forwarded += 1;
        if cut_after_frames.is_some_and(|limit| forwarded >= limit) {
            break;
        }
    }

    // Tear down the client-facing and server-facing halves together so a
    // chunk already queued for the server isn't relayed after the cutoff.
    cancel.cancel();
    let _ = c2s.await;
}
