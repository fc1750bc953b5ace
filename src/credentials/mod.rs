//! Encrypted-at-rest store of `ClientRecord`s (§4.2).
//!
//! The whole record set lives in one artifact, encrypted as a single AEAD
//! blob and replaced atomically (write-temp-then-rename) on every mutation.
//! A single writer lock serializes mutations; reads prefer an in-memory,
//! TTL-bounded cache over decrypting the file.

pub mod crypto;

use crate::common::error::{Result, TransferError};
use crate::common::model::ClientRecord;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MAGIC: &[u8; 8] = b"MYSQLBAK";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FormatVersion {
    AeadV1 = 1,
}

impl FormatVersion {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(FormatVersion::AeadV1),
            other => Err(TransferError::Integrity {
                expected: "format version 1 (AEAD)".into(),
                actual: format!("unknown format version {other}"),
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ContainerMetadata {
    salt: String,
    nonce: String,
    kdf: String,
    iterations: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct RecordSet {
    records: BTreeMap<String, ClientRecord>,
}

struct CacheEntry {
    record: ClientRecord,
    cached_at: Instant,
}

/// Encrypted-at-rest client record store.
pub struct CredentialStore {
    path: PathBuf,
    passphrase: Vec<u8>,
    write_lock: Mutex<()>,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
}

impl CredentialStore {
    /// Opens a store at `path`. `passphrase` must be at least 16 bytes, per
    /// §4.2. The file is created on first `put` if it doesn't exist yet.
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<Vec<u8>>) -> Result<Self> {
        let passphrase = passphrase.into();
        if passphrase.len() < 16 {
            return Err(TransferError::Internal(anyhow::anyhow!(
                "credential store passphrase must be at least 16 bytes"
            )));
        }
        Ok(Self {
            path: path.into(),
            passphrase,
            write_lock: Mutex::new(()),
            cache: DashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
        })
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub async fn put(&self, mut record: ClientRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut set = self.load_record_set().await?;
        record.generation = 0;
        let client_id = record.client_id.clone();
        if set.records.contains_key(&client_id) {
            return Err(TransferError::Conflict(format!(
                "client {client_id} already exists"
            )));
        }
        set.records.insert(client_id.clone(), record.clone());
        self.write_record_set(&set).await?;
        self.cache.insert(
            client_id,
            CacheEntry {
                record,
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub async fn get(&self, client_id: &str) -> Result<ClientRecord> {
        if let Some(entry) = self.cache.get(client_id) {
            if entry.cached_at.elapsed() < self.cache_ttl {
                return Ok(entry.record.clone());
            }
        }
        let set = self.load_record_set().await?;
        let record = set
            .records
            .get(client_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("client {client_id}")))?;
        self.cache.insert(
            client_id.to_string(),
            CacheEntry {
                record: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(record)
    }

    /// Replaces the record for `client_id` iff `expected_generation` matches
    /// the currently stored generation, bumping it by one on success.
    pub async fn update(
        &self,
        client_id: &str,
        expected_generation: u64,
        mutate: impl FnOnce(&mut ClientRecord),
    ) -> Result<ClientRecord> {
        let _guard = self.write_lock.lock().await;
        let mut set = self.load_record_set().await?;
        let record = set
            .records
            .get_mut(client_id)
            .ok_or_else(|| TransferError::NotFound(format!("client {client_id}")))?;
        if record.generation != expected_generation {
            return Err(TransferError::Conflict(format!(
                "client {client_id} generation mismatch: expected {expected_generation}, found {}",
                record.generation
            )));
        }
        mutate(record);
        record.generation += 1;
        let updated = record.clone();
        self.write_record_set(&set).await?;
        self.cache.remove(client_id);
        self.cache.insert(
            client_id.to_string(),
            CacheEntry {
                record: updated.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(updated)
    }

    pub async fn delete(&self, client_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut set = self.load_record_set().await?;
        if set.records.remove(client_id).is_none() {
            return Err(TransferError::NotFound(format!("client {client_id}")));
        }
        self.write_record_set(&set).await?;
        self.cache.remove(client_id);
        Ok(())
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let set = self.load_record_set().await?;
        Ok(set.records.keys().cloned().collect())
    }

    /// Attempts a full decrypt-and-parse of the artifact, returning whether
    /// it succeeds. Used for operational health checks, not on the hot path.
    pub async fn verify_integrity(&self) -> bool {
        self.load_record_set().await.is_ok()
    }

    async fn load_record_set(&self) -> Result<RecordSet> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordSet::default()),
            Err(e) => return Err(TransferError::Internal(e.into())),
        };
        decode_container(&bytes, &self.passphrase)
    }

    async fn write_record_set(&self, set: &RecordSet) -> Result<()> {
        let plaintext = serde_json::to_vec(set).map_err(|e| TransferError::Internal(e.into()))?;
        let bytes = encode_container(&plaintext, &self.passphrase)?;
        atomic_write(&self.path, &bytes).await
    }
}

fn encode_container(plaintext: &[u8], passphrase: &[u8]) -> Result<Vec<u8>> {
    let salt = crypto::random_salt();
    let nonce = crypto::random_nonce();
    let key = crypto::derive_key(passphrase, &salt);
    let ciphertext = crypto::encrypt(&key, &nonce, plaintext)?;

    let metadata = ContainerMetadata {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        kdf: "pbkdf2-hmac-sha256".to_string(),
        iterations: crypto::PBKDF2_ITERATIONS,
    };
    let metadata_json = serde_json::to_vec(&metadata).map_err(|e| TransferError::Internal(e.into()))?;

    let mut out = Vec::with_capacity(8 + 4 + metadata_json.len() + 1 + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(metadata_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&metadata_json);
    out.push(FormatVersion::AeadV1 as u8);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decode_container(bytes: &[u8], passphrase: &[u8]) -> Result<RecordSet> {
    if bytes.len() < 8 + 4 || &bytes[0..8] != MAGIC {
        return Err(TransferError::Integrity {
            expected: "MYSQLBAK magic header".into(),
            actual: "missing or corrupt header".into(),
        });
    }
    let metadata_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let metadata_start = 12;
    let metadata_end = metadata_start
        .checked_add(metadata_len)
        .filter(|&end| end + 1 <= bytes.len())
        .ok_or_else(|| TransferError::Integrity {
            expected: "metadata length within file bounds".into(),
            actual: "truncated credential artifact".into(),
        })?;

    let metadata: ContainerMetadata = serde_json::from_slice(&bytes[metadata_start..metadata_end])
        .map_err(|e| TransferError::Integrity {
            expected: "parseable container metadata".into(),
            actual: e.to_string(),
        })?;

    let version_byte = bytes[metadata_end];
    let _version = FormatVersion::from_byte(version_byte)?;
    let ciphertext = &bytes[metadata_end + 1..];

    let salt = hex::decode(&metadata.salt).map_err(|e| TransferError::Internal(e.into()))?;
    let nonce = hex::decode(&metadata.nonce).map_err(|e| TransferError::Internal(e.into()))?;
    let nonce: [u8; 12] = nonce
        .try_into()
        .map_err(|_| TransferError::Integrity {
            expected: "12-byte nonce".into(),
            actual: "malformed nonce length".into(),
        })?;

    let key = crypto::derive_key(passphrase, &salt);
    let plaintext = crypto::decrypt(&key, &nonce, ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| TransferError::Integrity {
        expected: "parseable record set JSON".into(),
        actual: e.to_string(),
    })
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("credentials")
    ));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    file.write_all(bytes).await.map_err(|e| TransferError::Internal(e.into()))?;
    file.sync_all().await.map_err(|e| TransferError::Internal(e.into()))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;
    debug!(path = %path.display(), "credential store written atomically");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn sample_record(id: &str) -> ClientRecord {
        ClientRecord {
            client_id: id.to_string(),
            secret_hash: vec![1, 2, 3],
            salt: vec![4, 5, 6],
            display_name: "tester".into(),
            permissions: BTreeSet::from(["transfer".to_string()]),
            active: true,
            created_at: Utc::now(),
            expires_at: None,
            generation: 0,
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("creds.bin"), b"a very secret passphrase!!".to_vec()).unwrap();
        store.put(sample_record("c1")).await.unwrap();
        let fetched = store.get("c1").await.unwrap();
        assert_eq!(fetched.client_id, "c1");
    }

    #[tokio::test]
    async fn put_same_client_twice_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("creds.bin"), b"a very secret passphrase!!".to_vec()).unwrap();
        store.put(sample_record("c1")).await.unwrap();
        let err = store.put(sample_record("c1")).await.unwrap_err();
        assert!(matches!(err, TransferError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_with_stale_generation_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("creds.bin"), b"a very secret passphrase!!".to_vec()).unwrap();
        store.put(sample_record("c1")).await.unwrap();
        store.update("c1", 0, |r| r.display_name = "renamed".into()).await.unwrap();
        let err = store.update("c1", 0, |r| r.display_name = "renamed-again".into()).await.unwrap_err();
        assert!(matches!(err, TransferError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_missing_client_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("creds.bin"), b"a very secret passphrase!!".to_vec()).unwrap();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn survives_reopen_with_same_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let store = CredentialStore::new(&path, b"a very secret passphrase!!".to_vec()).unwrap();
        store.put(sample_record("c1")).await.unwrap();
        drop(store);

        let reopened = CredentialStore::new(&path, b"a very secret passphrase!!".to_vec()).unwrap();
        let fetched = reopened.get("c1").await.unwrap();
        assert_eq!(fetched.client_id, "c1");
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let store = CredentialStore::new(&path, b"a very secret passphrase!!".to_vec()).unwrap();
        store.put(sample_record("c1")).await.unwrap();
        drop(store);

        let reopened = CredentialStore::new(&path, b"a totally different passphrase".to_vec()).unwrap();
        assert!(!reopened.verify_integrity().await);
    }
}
