//! Shared data types (§3 of the design): client records, tokens, file
//! descriptors, chunking policy, transfer sessions, resume tokens, and
//! audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An authenticatable client. `client_id` and `created_at` are immutable
/// after creation; all other fields mutate only through `CredentialStore::update`,
/// which bumps `generation` for optimistic-concurrency conflict detection.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ClientRecord {
    pub client_id: String,
    /// Salted, one-way hash of the shared secret. Never the cleartext.
    pub secret_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub display_name: String,
    pub permissions: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Bumped on every `update`; backs `CredentialStore`'s conflict check.
    pub generation: u64,
}

impl ClientRecord {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

/// A short-lived bearer token minted on successful authentication.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct AuthToken {
    pub token_id: String,
    pub client_id: String,
    pub permissions: BTreeSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-client in-memory lockout bookkeeping. Never persisted.
#[derive(Clone, Debug)]
pub struct FailedAttemptBucket {
    pub count: u32,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

/// Descriptor of the whole file being transferred.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub logical_name: String,
    pub size: u64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub source_tag: Option<String>,
}

/// Chunk size plus the chunk count it implies for a given file size.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingPolicy {
    pub chunk_size: u64,
}

impl ChunkingPolicy {
    pub fn new(chunk_size: u64) -> Self {
        assert!(chunk_size >= 1, "chunk_size must be >= 1");
        Self { chunk_size }
    }

    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size).max(1)
    }

    /// Length of the chunk at `index` for a file of `size` bytes. The final
    /// chunk is `size mod chunk_size`, or `chunk_size` if that's zero.
    pub fn chunk_len(&self, size: u64, index: u64) -> u64 {
        let start = index * self.chunk_size;
        let remaining = size.saturating_sub(start);
        remaining.min(self.chunk_size)
    }

    /// Whether a file of `size` bytes fits the direct (non-chunked) path.
    pub fn is_direct(&self, size: u64) -> bool {
        size <= self.chunk_size
    }
}

/// Audit event operation kinds. Closed enum rather than a free string.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Authenticate,
    Introspect,
    TransferBegin,
    ChunkIngest,
    Finalize,
    Resume,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub client_id: Option<String>,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub source_address: Option<String>,
    pub duration_millis: u64,
}

/// Server-side per-transfer state. Mutated only by the chunk ingress
/// handler of its owning connection.
#[derive(Clone, Debug)]
pub struct TransferSession {
    pub transfer_id: String,
    pub descriptor: FileDescriptor,
    pub policy: ChunkingPolicy,
    pub staging_dir: std::path::PathBuf,
    pub completed_chunks: BTreeSet<u64>,
    pub last_activity: DateTime<Utc>,
    pub terminal: bool,
}

impl TransferSession {
    pub fn chunk_count(&self) -> u64 {
        self.policy.chunk_count(self.descriptor.size)
    }

    pub fn is_fully_reassembled(&self) -> bool {
        let expected: BTreeSet<u64> = (0..self.chunk_count()).collect();
        self.completed_chunks == expected
    }
}

/// Printable, opaque resume handle: `RT_<unixSeconds>_<16-hex-chars>`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn mint(issued_at: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self(format!(
            "RT_{}_{}",
            issued_at.timestamp(),
            hex::encode(bytes)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable record backing a `ResumeToken` in the `ResumeStore`.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ResumeRecord {
    pub token: ResumeToken,
    pub transfer_id: String,
    pub descriptor: FileDescriptor,
    pub staging_dir: std::path::PathBuf,
    pub completed_chunks: BTreeSet<u64>,
    pub completed: bool,
    pub last_activity: DateTime<Utc>,
}
