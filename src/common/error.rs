//! Shared error taxonomy for the transfer subsystem.
//!
//! Every fault observed anywhere in the core — credential store, auth,
//! chunk manager, resume store, server, client, recovery coordinator —
//! is represented as one of these kinds. Components never invent ad-hoc
//! string errors; they pick the kind that matches and attach context.

use thiserror::Error;

/// The full fault taxonomy from the error handling design.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("authentication failed")]
    Auth,

    #[error("not authorized for this operation")]
    Authz,

    #[error("token expired")]
    TokenExpired,

    #[error("client locked out, retry after {retry_after_secs}s")]
    LockedOut { retry_after_secs: u64 },

    #[error("storage full")]
    StorageFull,

    #[error("integrity check failed: expected {expected}, actual {actual}")]
    Integrity { expected: String, actual: String },

    #[error("checksum mismatch for chunk {chunk_index}")]
    Checksum { chunk_index: u64 },

    #[error("chunk arrived out of order: expected {expected}, got {got}")]
    Order { expected: u64, got: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation {operation} timed out after {actual_ms}ms (configured {configured_ms}ms)")]
    Timeout {
        operation: String,
        configured_ms: u64,
        actual_ms: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TransferError {
    /// Maps a fault to the process exit code convention of the embedding CLI.
    ///
    /// The library itself never calls `process::exit`; this is consulted
    /// only by the `xferctl` binary's `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            TransferError::Integrity { .. } | TransferError::Checksum { .. } => 65,
            TransferError::Auth
            | TransferError::Authz
            | TransferError::TokenExpired
            | TransferError::LockedOut { .. }
            | TransferError::StorageFull
            | TransferError::Unavailable(_) => 69,
            TransferError::Protocol(_) | TransferError::Transport(_) | TransferError::Order { .. } => 73,
            TransferError::Timeout { .. } => 124,
            TransferError::NotFound(_) | TransferError::Conflict(_) => 65,
            TransferError::Internal(_) => 1,
        }
    }

    /// Whether the recovery coordinator's default table treats this kind as
    /// retryable on its own (without additional context such as "resume
    /// token present"). See `recovery::Decision` for the full table, which
    /// consults more than just the error kind for a few cases.
    pub fn is_unconditionally_retryable(&self) -> bool {
        matches!(self, TransferError::Transport(_))
    }
}

/// The public, wire-facing result of a transfer attempt. Never a thrown
/// exception at the boundary — callers always get this record back.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub bytes_transferred: u64,
    pub duration_millis: u64,
}

impl TransferOutcome {
    pub fn ok(bytes_transferred: u64, duration_millis: u64) -> Self {
        Self {
            success: true,
            error_message: None,
            bytes_transferred,
            duration_millis,
        }
    }

    pub fn failed(err: &TransferError, bytes_transferred: u64, duration_millis: u64) -> Self {
        Self {
            success: false,
            error_message: Some(generic_message(err)),
            bytes_transferred,
            duration_millis,
        }
    }
}

/// Generic, non-leaking message for the wire. Auth failures never reveal
/// which check failed; integrity failures state kind but not the raw
/// expected/actual digests (those go to the log, not the wire).
fn generic_message(err: &TransferError) -> String {
    match err {
        TransferError::Auth | TransferError::LockedOut { .. } => "invalid credentials".to_string(),
        TransferError::Integrity { .. } => "integrity verification failed".to_string(),
        TransferError::Timeout {
            operation,
            configured_ms,
            actual_ms,
        } => format!(
            "{operation} timed out (configured {configured_ms}ms, measured {actual_ms}ms)"
        ),
        other => other.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
