//! Durable index of in-flight transfers and their completed chunk sets
//! (§4.6). Backed by a single JSON file rewritten atomically on every
//! durable mutation; an in-memory map mirrors it for fast lookups.

use crate::common::config::ResumeConfig;
use crate::common::error::{Result, TransferError};
use crate::common::model::{FileDescriptor, ResumeRecord, ResumeToken};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Serialize, Deserialize, Default)]
struct PersistedIndex {
    records: Vec<ResumeRecord>,
}

/// Durable `token <-> transfer` index.
pub struct ResumeStore {
    path: PathBuf,
    config: ResumeConfig,
    by_token: DashMap<ResumeToken, ResumeRecord>,
    transfer_to_token: DashMap<String, ResumeToken>,
    write_lock: Mutex<()>,
}

impl ResumeStore {
    /// Loads an existing index from `path`, or starts empty if absent.
    pub async fn open(path: impl Into<PathBuf>, config: ResumeConfig) -> Result<Arc<Self>> {
        let path = path.into();
        let persisted = load_index(&path).await?;
        let by_token = DashMap::new();
        let transfer_to_token = DashMap::new();
        for record in persisted.records {
            transfer_to_token.insert(record.transfer_id.clone(), record.token.clone());
            by_token.insert(record.token.clone(), record);
        }
        Ok(Arc::new(Self {
            path,
            config,
            by_token,
            transfer_to_token,
            write_lock: Mutex::new(()),
        }))
    }

    pub async fn add(
        &self,
        transfer_id: &str,
        descriptor: FileDescriptor,
        staging_dir: PathBuf,
    ) -> Result<ResumeToken> {
        let token = ResumeToken::mint(Utc::now());
        let record = ResumeRecord {
            token: token.clone(),
            transfer_id: transfer_id.to_string(),
            descriptor,
            staging_dir,
            completed_chunks: Default::default(),
            completed: false,
            last_activity: Utc::now(),
        };
        self.by_token.insert(token.clone(), record);
        self.transfer_to_token.insert(transfer_id.to_string(), token.clone());
        self.persist().await?;
        Ok(token)
    }

    pub fn get_by_token(&self, token: &ResumeToken) -> Result<ResumeRecord> {
        self.by_token
            .get(token)
            .map(|r| r.clone())
            .ok_or_else(|| TransferError::NotFound(format!("resume token {token}")))
    }

    pub fn get_by_transfer_id(&self, transfer_id: &str) -> Result<ResumeRecord> {
        let token = self
            .transfer_to_token
            .get(transfer_id)
            .ok_or_else(|| TransferError::NotFound(format!("transfer {transfer_id}")))?;
        self.get_by_token(&token)
    }

    pub async fn append_completed_chunk(&self, token: &ResumeToken, index: u64) -> Result<()> {
        {
            let mut entry = self
                .by_token
                .get_mut(token)
                .ok_or_else(|| TransferError::NotFound(format!("resume token {token}")))?;
            entry.completed_chunks.insert(index);
            entry.last_activity = Utc::now();
        }
        self.persist().await
    }

    pub async fn mark_completed(&self, token: &ResumeToken) -> Result<()> {
        {
            let mut entry = self
                .by_token
                .get_mut(token)
                .ok_or_else(|| TransferError::NotFound(format!("resume token {token}")))?;
            entry.completed = true;
            entry.last_activity = Utc::now();
        }
        self.persist().await
    }

    /// Bumps `lastActivity` without a durability requirement of its own —
    /// §4.6 only mandates fsync-equivalent durability for `add`,
    /// `markCompleted`, and `appendCompletedChunk`.
    pub fn touch_activity(&self, token: &ResumeToken) -> Result<()> {
        let mut entry = self
            .by_token
            .get_mut(token)
            .ok_or_else(|| TransferError::NotFound(format!("resume token {token}")))?;
        entry.last_activity = Utc::now();
        Ok(())
    }

    /// Whether `token` is still usable: its session isn't completed and
    /// `lastActivity` is within the configured TTL.
    pub fn is_valid(&self, token: &ResumeToken) -> bool {
        let Some(entry) = self.by_token.get(token) else {
            return false;
        };
        !entry.completed && (Utc::now() - entry.last_activity).to_std().unwrap_or_default() <= self.config.ttl
    }

    /// Explicitly removes one entry, e.g. once a transfer's staging
    /// directory has been cleaned up and its resume token is no longer
    /// meaningful.
    pub async fn remove(&self, token: &ResumeToken) -> Result<()> {
        if let Some((_, record)) = self.by_token.remove(token) {
            self.transfer_to_token.remove(&record.transfer_id);
            self.persist().await?;
        }
        Ok(())
    }

    /// Drops entries whose `lastActivity` exceeds the TTL.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<ResumeToken> = self
            .by_token
            .iter()
            .filter(|entry| (now - entry.last_activity).to_std().unwrap_or_default() > self.config.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        for token in &expired {
            if let Some((_, record)) = self.by_token.remove(token) {
                self.transfer_to_token.remove(&record.transfer_id);
            }
        }
        if !expired.is_empty() {
            self.persist().await?;
        }
        Ok(expired.len())
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let records: Vec<ResumeRecord> = self.by_token.iter().map(|e| e.value().clone()).collect();
        let index = PersistedIndex { records };
        let bytes = serde_json::to_vec(&index).map_err(|e| TransferError::Internal(e.into()))?;
        atomic_write(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), "resume store persisted");
        Ok(())
    }
}

async fn load_index(path: &Path) -> Result<PersistedIndex> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| TransferError::Internal(e.into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedIndex::default()),
        Err(e) => Err(TransferError::Internal(e.into())),
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await.map_err(|e| TransferError::Internal(e.into()))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("resume")
    ));
    let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| TransferError::Internal(e.into()))?;
    file.write_all(bytes).await.map_err(|e| TransferError::Internal(e.into()))?;
    file.sync_all().await.map_err(|e| TransferError::Internal(e.into()))?;
    drop(file);
    tokio::fs::rename(&tmp_path, path).await.map_err(|e| TransferError::Internal(e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_descriptor() -> FileDescriptor {
        FileDescriptor {
            logical_name: "backup.dump".into(),
            size: 16 * 1024 * 1024,
            md5: None,
            sha256: None,
            created_at: Utc::now(),
            source_tag: None,
        }
    }

    #[tokio::test]
    async fn add_then_lookup_by_token_and_transfer_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::open(dir.path().join("resume.json"), ResumeConfig::default())
            .await
            .unwrap();
        let token = store
            .add("t1", sample_descriptor(), dir.path().join("staging"))
            .await
            .unwrap();

        let by_token = store.get_by_token(&token).unwrap();
        assert_eq!(by_token.transfer_id, "t1");
        let by_transfer = store.get_by_transfer_id("t1").unwrap();
        assert_eq!(by_transfer.token, token);
    }

    #[tokio::test]
    async fn append_completed_chunk_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let store = ResumeStore::open(&path, ResumeConfig::default()).await.unwrap();
        let token = store
            .add("t1", sample_descriptor(), dir.path().join("staging"))
            .await
            .unwrap();
        store.append_completed_chunk(&token, 0).await.unwrap();
        store.append_completed_chunk(&token, 1).await.unwrap();

        let reopened = ResumeStore::open(&path, ResumeConfig::default()).await.unwrap();
        let record = reopened.get_by_token(&token).unwrap();
        assert_eq!(record.completed_chunks.len(), 2);
    }

    #[tokio::test]
    async fn purge_expired_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = ResumeConfig { ttl: Duration::from_millis(1) };
        let store = ResumeStore::open(dir.path().join("resume.json"), config).await.unwrap();
        let token = store
            .add("t1", sample_descriptor(), dir.path().join("staging"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let purged = store.purge_expired().await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_by_token(&token).is_err());
    }

    #[tokio::test]
    async fn is_valid_false_once_marked_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::open(dir.path().join("resume.json"), ResumeConfig::default())
            .await
            .unwrap();
        let token = store
            .add("t1", sample_descriptor(), dir.path().join("staging"))
            .await
            .unwrap();
        assert!(store.is_valid(&token));
        store.mark_completed(&token).await.unwrap();
        assert!(!store.is_valid(&token));
    }
}
