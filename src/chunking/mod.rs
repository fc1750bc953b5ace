//! Per-transfer server-side state: chunk staging, reassembly, and the
//! resume-token lifecycle (§4.5).

use crate::checksum;
use crate::common::error::{Result, TransferError};
use crate::common::model::{ChunkingPolicy, FileDescriptor, ResumeToken, TransferSession};
use crate::protocol::staging_filename;
use crate::resume::ResumeStore;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of `ingest`: whether the write succeeded, the chunk index, and
/// the (non-authoritative) completion hint from the wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub ok: bool,
    pub chunk_index: u64,
    pub is_complete_hint: bool,
}

/// Owns all server-side `TransferSession`s. Sessions are looked up and
/// mutated under a short-held per-entry lock; chunk I/O happens outside
/// that lock.
pub struct ChunkManager {
    staging_root: PathBuf,
    resume_store: Arc<ResumeStore>,
    sessions: DashMap<String, Arc<Mutex<TransferSession>>>,
}

impl ChunkManager {
    pub fn new(staging_root: impl Into<PathBuf>, resume_store: Arc<ResumeStore>) -> Self {
        Self {
            staging_root: staging_root.into(),
            resume_store,
            sessions: DashMap::new(),
        }
    }

    /// Allocates a fresh transfer: a UUID identifier, an exclusive staging
    /// directory, and an inserted session.
    pub async fn begin(&self, descriptor: FileDescriptor, policy: ChunkingPolicy) -> Result<String> {
        let transfer_id = Uuid::new_v4().to_string();
        let staging_dir = self.staging_root.join(&transfer_id);
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| TransferError::Internal(e.into()))?;

        let session = TransferSession {
            transfer_id: transfer_id.clone(),
            descriptor,
            policy,
            staging_dir,
            completed_chunks: BTreeSet::new(),
            last_activity: Utc::now(),
            terminal: false,
        };
        self.sessions.insert(transfer_id.clone(), Arc::new(Mutex::new(session)));
        debug!(transfer_id, "transfer session started");
        Ok(transfer_id)
    }

    /// Rehydrates a session from a `ResumeStore` entry. Fails if the token
    /// is unknown or its transfer is already marked completed. `policy` is
    /// the chunking strategy the client re-declares in its resume request.
    pub async fn restore(&self, token: &ResumeToken, descriptor: FileDescriptor, policy: ChunkingPolicy) -> Result<String> {
        let record = self.resume_store.get_by_token(token)?;
        if record.completed {
            return Err(TransferError::Conflict(format!(
                "resume token {token} refers to a completed transfer"
            )));
        }

        let on_disk = scan_completed_chunks(&record.staging_dir).await?;
        let completed_chunks: BTreeSet<u64> = record
            .completed_chunks
            .intersection(&on_disk)
            .copied()
            .collect();

        let session = TransferSession {
            transfer_id: record.transfer_id.clone(),
            descriptor,
            policy,
            staging_dir: record.staging_dir.clone(),
            completed_chunks,
            last_activity: Utc::now(),
            terminal: false,
        };

        let transfer_id = record.transfer_id.clone();
        self.sessions.insert(transfer_id.clone(), Arc::new(Mutex::new(session)));
        self.resume_store.touch_activity(token)?;
        Ok(transfer_id)
    }

    /// Verifies (if a digest is supplied), stages, and records one chunk.
    pub async fn ingest(
        &self,
        transfer_id: &str,
        chunk_index: u64,
        data: &[u8],
        chunk_checksum: Option<&str>,
        is_last_chunk: bool,
    ) -> Result<IngestOutcome> {
        let session_lock = self
            .sessions
            .get(transfer_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| TransferError::NotFound(format!("transfer {transfer_id}")))?;

        if let Some(expected) = chunk_checksum {
            let actual = checksum::digest_buffer(data);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(TransferError::Checksum { chunk_index });
            }
        }

        let (staging_dir, chunk_count) = {
            let session = session_lock.lock().await;
            (session.staging_dir.clone(), session.chunk_count())
        };

        write_chunk_atomically(&staging_dir, chunk_index, chunk_count, data).await?;

        let completed_len = {
            let mut session = session_lock.lock().await;
            session.completed_chunks.insert(chunk_index);
            session.last_activity = Utc::now();
            session.completed_chunks.len() as u64
        };

        if let Ok(record) = self.resume_store.get_by_transfer_id(transfer_id) {
            if let Err(e) = self
                .resume_store
                .append_completed_chunk(&record.token, chunk_index)
                .await
            {
                warn!(transfer_id, chunk_index, error = %e, "best-effort resume-store update failed");
            }
        }

        Ok(IngestOutcome {
            ok: true,
            chunk_index,
            is_complete_hint: is_last_chunk && completed_len == chunk_index + 1,
        })
    }

    /// Asserts full reassembly, concatenates chunks in order, verifies
    /// length and digests, and removes the staging directory.
    pub async fn finalize(&self, transfer_id: &str, target_path: Option<PathBuf>) -> Result<PathBuf> {
        let session_lock = self
            .sessions
            .get(transfer_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| TransferError::NotFound(format!("transfer {transfer_id}")))?;

        let (descriptor, policy, staging_dir, completed_chunks) = {
            let session = session_lock.lock().await;
            (
                session.descriptor.clone(),
                session.policy,
                session.staging_dir.clone(),
                session.completed_chunks.clone(),
            )
        };

        let chunk_count = policy.chunk_count(descriptor.size);
        let expected: BTreeSet<u64> = (0..chunk_count).collect();
        if completed_chunks != expected {
            return Err(TransferError::Internal(anyhow::anyhow!(
                "finalize called with incomplete chunk set for transfer {transfer_id}: have {}, need {}",
                completed_chunks.len(),
                chunk_count
            )));
        }

        let final_path = target_path.unwrap_or_else(|| staging_dir.join(&descriptor.logical_name));
        concatenate_chunks(&staging_dir, chunk_count, &final_path).await?;

        let actual_len = tokio::fs::metadata(&final_path)
            .await
            .map_err(|e| TransferError::Internal(e.into()))?
            .len();
        if actual_len != descriptor.size {
            let _ = tokio::fs::remove_file(&final_path).await;
            return Err(TransferError::Integrity {
                expected: descriptor.size.to_string(),
                actual: actual_len.to_string(),
            });
        }

        if descriptor.md5.is_some() || descriptor.sha256.is_some() {
            let matches = checksum::verify_file(&final_path, descriptor.md5.as_deref(), descriptor.sha256.as_deref())
                .await?;
            if !matches {
                let _ = tokio::fs::remove_file(&final_path).await;
                return Err(TransferError::Integrity {
                    expected: "descriptor digest".into(),
                    actual: "mismatched digest after reassembly".into(),
                });
            }
        }

        let _ = tokio::fs::remove_dir_all(&staging_dir).await;

        if let Ok(record) = self.resume_store.get_by_transfer_id(transfer_id) {
            if let Err(e) = self.resume_store.mark_completed(&record.token).await {
                warn!(transfer_id, error = %e, "failed to mark resume store entry completed");
            }
        }

        self.sessions.remove(transfer_id);
        Ok(final_path)
    }

    /// Mints a durable resume handle for an in-progress transfer.
    pub async fn mint_resume(&self, transfer_id: &str) -> Result<ResumeToken> {
        let session_lock = self
            .sessions
            .get(transfer_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| TransferError::NotFound(format!("transfer {transfer_id}")))?;
        let session = session_lock.lock().await;
        self.resume_store
            .add(transfer_id, session.descriptor.clone(), session.staging_dir.clone())
            .await
    }

    pub fn resume_info(&self, token: &ResumeToken) -> Result<(FileDescriptor, BTreeSet<u64>)> {
        let record = self.resume_store.get_by_token(token)?;
        Ok((record.descriptor, record.completed_chunks))
    }

    pub async fn cleanup_resume(&self, token: &ResumeToken) -> Result<()> {
        self.resume_store.remove(token).await
    }

    /// Tears down a session that ended in failure (§4.9 "Cleanup on
    /// error"). The in-memory session entry is always removed; when
    /// `retriable` is false the staging directory and any `ResumeStore`
    /// entry are deleted too, since no later resume is possible. When
    /// `retriable` is true, staging and the resume entry are left intact
    /// so a reconnect can `restore` the transfer.
    pub async fn abort(&self, transfer_id: &str, retriable: bool) {
        let Some((_, session_lock)) = self.sessions.remove(transfer_id) else {
            return;
        };
        let staging_dir = session_lock.lock().await.staging_dir.clone();

        if retriable {
            debug!(transfer_id, path = %staging_dir.display(), "retriable failure, preserving staging directory and resume entry");
            return;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&staging_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(transfer_id, path = %staging_dir.display(), error = %e, "failed to remove staging directory after non-retriable failure");
            }
        }
        if let Ok(record) = self.resume_store.get_by_transfer_id(transfer_id) {
            if let Err(e) = self.resume_store.remove(&record.token).await {
                warn!(transfer_id, error = %e, "failed to remove resume-store entry after non-retriable failure");
            }
        }
    }
}

async fn scan_completed_chunks(staging_dir: &std::path::Path) -> Result<BTreeSet<u64>> {
    let mut entries = match tokio::fs::read_dir(staging_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(TransferError::Internal(e.into())),
    };

    let mut indices = BTreeSet::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| TransferError::Internal(e.into()))? {
        if let Some(name) = entry.file_name().to_str() {
            if let Some(index) = parse_chunk_index(name) {
                indices.insert(index);
            }
        }
    }
    Ok(indices)
}

fn parse_chunk_index(filename: &str) -> Option<u64> {
    let stripped = filename.strip_prefix("chunk_")?.strip_suffix(".bin")?;
    stripped.parse().ok()
}

async fn write_chunk_atomically(staging_dir: &std::path::Path, index: u64, chunk_count: u64, data: &[u8]) -> Result<()> {
    let filename = staging_filename(index, chunk_count);
    let final_path = staging_dir.join(&filename);
    let tmp_path = staging_dir.join(format!(".{filename}.tmp"));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    file.write_all(data).await.map_err(|e| TransferError::Internal(e.into()))?;
    file.sync_all().await.map_err(|e| TransferError::Internal(e.into()))?;
    drop(file);

    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    Ok(())
}

async fn concatenate_chunks(staging_dir: &std::path::Path, chunk_count: u64, final_path: &std::path::Path) -> Result<()> {
    let mut out = tokio::fs::File::create(final_path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;

    for index in 0..chunk_count {
        let filename = staging_filename(index, chunk_count);
        let mut chunk_file = tokio::fs::File::open(staging_dir.join(&filename))
            .await
            .map_err(|e| TransferError::Internal(e.into()))?;
        let mut buf = Vec::new();
        chunk_file
            .read_to_end(&mut buf)
            .await
            .map_err(|e| TransferError::Internal(e.into()))?;
        out.write_all(&buf).await.map_err(|e| TransferError::Internal(e.into()))?;
    }
    out.sync_all().await.map_err(|e| TransferError::Internal(e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ResumeConfig;

    fn descriptor(size: u64) -> FileDescriptor {
        FileDescriptor {
            logical_name: "backup.dump".into(),
            size,
            md5: None,
            sha256: None,
            created_at: Utc::now(),
            source_tag: None,
        }
    }

    async fn manager(dir: &std::path::Path) -> ChunkManager {
        let resume_store = ResumeStore::open(dir.join("resume.json"), ResumeConfig::default())
            .await
            .unwrap();
        ChunkManager::new(dir.join("staging"), resume_store)
    }

    #[tokio::test]
    async fn begin_ingest_finalize_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let policy = ChunkingPolicy::new(4);
        let transfer_id = manager.begin(descriptor(8), policy).await.unwrap();

        let outcome0 = manager.ingest(&transfer_id, 0, b"aaaa", None, false).await.unwrap();
        assert!(outcome0.ok);
        let outcome1 = manager.ingest(&transfer_id, 1, b"bbbb", None, true).await.unwrap();
        assert!(outcome1.is_complete_hint);

        let final_path = manager.finalize(&transfer_id, None).await.unwrap();
        let contents = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(contents, b"aaaabbbb");
    }

    #[tokio::test]
    async fn ingest_rejects_bad_chunk_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let transfer_id = manager.begin(descriptor(4), ChunkingPolicy::new(4)).await.unwrap();

        let err = manager
            .ingest(&transfer_id, 0, b"data", Some("deadbeef"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Checksum { chunk_index: 0 }));
    }

    #[tokio::test]
    async fn finalize_before_all_chunks_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let transfer_id = manager.begin(descriptor(8), ChunkingPolicy::new(4)).await.unwrap();
        manager.ingest(&transfer_id, 0, b"aaaa", None, false).await.unwrap();

        let err = manager.finalize(&transfer_id, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Internal(_)));
    }

    #[tokio::test]
    async fn finalize_with_tampered_data_fails_whole_file_digest_and_deletes_output() {
        // Mirrors §8 scenario 4: per-chunk digests are absent (so the bad
        // chunk is staged), but the whole-file digest declared up front
        // catches the tamper at finalize and the output is not left behind.
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let mut descriptor = descriptor(8);
        descriptor.md5 = Some(checksum::digest_buffer(b"aaaabbbb"));
        let transfer_id = manager.begin(descriptor, ChunkingPolicy::new(4)).await.unwrap();

        manager.ingest(&transfer_id, 0, b"aaaa", None, false).await.unwrap();
        // Tampered: should have been "bbbb" to match the declared digest.
        manager.ingest(&transfer_id, 1, b"XXXX", None, true).await.unwrap();

        let err = manager.finalize(&transfer_id, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Integrity { .. }));

        let expected_path = dir.path().join("staging").join(&transfer_id).join("backup.dump");
        assert!(!expected_path.exists(), "tampered output must be deleted, not left behind");
    }

    #[tokio::test]
    async fn mint_resume_then_restore_recovers_completed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let transfer_id = manager.begin(descriptor(8), ChunkingPolicy::new(4)).await.unwrap();
        manager.ingest(&transfer_id, 0, b"aaaa", None, false).await.unwrap();
        let token = manager.mint_resume(&transfer_id).await.unwrap();

        let restored_id = manager.restore(&token, descriptor(8), ChunkingPolicy::new(4)).await.unwrap();
        let outcome = manager.ingest(&restored_id, 1, b"bbbb", None, true).await.unwrap();
        assert!(outcome.ok);
        let final_path = manager.finalize(&restored_id, None).await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"aaaabbbb");
    }
}
