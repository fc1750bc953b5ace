//! The five frame payloads of §4.7, serialized as `camelCase` JSON, plus
//! the auth exchange that precedes them on every connection (§4.3/§4.7:
//! `AUTHORIZE` consults a token, so the client must mint one before it can
//! populate `RequestFrame::auth_token` — these two frames are how).

use crate::common::model::{ChunkingPolicy, FileDescriptor};
use serde::{Deserialize, Serialize};

/// Client → server, first frame on any connection: authenticates and
/// requests a short-lived `AuthToken` via `AuthService::authenticate`.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub client_id: String,
    /// Base64-encoded shared secret, matching the chunk payload convention.
    pub secret: String,
    pub request_timestamp: chrono::DateTime<chrono::Utc>,
}

/// Server → client, answers an `AuthFrame`.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthAckFrame {
    pub success: bool,
    pub token_id: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
}

impl AuthAckFrame {
    pub fn ok(token_id: impl Into<String>, expires_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            success: true,
            token_id: Some(token_id.into()),
            expires_at: Some(expires_at),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            token_id: None,
            expires_at: None,
            error_message: Some(message.into()),
        }
    }
}

/// Client → server, opens (or resumes) a transfer.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub transfer_id: String,
    pub metadata: FileDescriptor,
    pub chunking_strategy: ChunkingPolicy,
    pub resume_transfer: bool,
    pub resume_token: Option<String>,
    pub auth_token: String,
}

/// Server → client, answers a `RequestFrame`. On a resumed transfer,
/// `additional_info` carries the JSON array of already-completed chunk
/// indices so the client knows what to skip.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub success: bool,
    pub error_message: Option<String>,
    pub additional_info: Option<serde_json::Value>,
}

impl AckFrame {
    pub fn ok_with_completed_chunks(completed: &[u64]) -> Self {
        Self {
            success: true,
            error_message: None,
            additional_info: Some(serde_json::json!(completed)),
        }
    }

    /// Hands a freshly minted resume token back on the ack for a non-resume
    /// request, the only point in the protocol where the client learns it.
    pub fn ok_with_resume_token(token: &crate::common::model::ResumeToken) -> Self {
        Self {
            success: true,
            error_message: None,
            additional_info: Some(serde_json::json!({ "resumeToken": token.as_str() })),
        }
    }

    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
            additional_info: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            additional_info: None,
        }
    }
}

/// Client → server, one chunk of the file. `data` is base64-encoded
/// binary, per §6.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    pub transfer_id: String,
    pub chunk_index: u64,
    pub data: String,
    pub chunk_checksum: Option<String>,
    pub is_last_chunk: bool,
}

/// Server → client, acknowledges one `ChunkFrame`.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckFrame {
    pub success: bool,
    pub chunk_index: u64,
    pub error_message: Option<String>,
}

impl ChunkAckFrame {
    pub fn ok(chunk_index: u64) -> Self {
        Self {
            success: true,
            chunk_index,
            error_message: None,
        }
    }

    pub fn failure(chunk_index: u64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            chunk_index,
            error_message: Some(message.into()),
        }
    }
}

/// Server → client, terminal frame for the transfer.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FinalFrame {
    pub success: bool,
    pub additional_info: Option<String>,
    pub error_message: Option<String>,
}

impl FinalFrame {
    pub fn ok(final_path: impl Into<String>) -> Self {
        Self {
            success: true,
            additional_info: Some(final_path.into()),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            additional_info: None,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_frame_serializes_camel_case_fields() {
        let ack = AckFrame::ok_with_completed_chunks(&[0, 1, 2]);
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"additionalInfo\""));
        assert!(json.contains("\"errorMessage\""));
    }

    #[test]
    fn chunk_ack_frame_roundtrips() {
        let ack = ChunkAckFrame::failure(4, "bad checksum");
        let json = serde_json::to_string(&ack).unwrap();
        let parsed: ChunkAckFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.chunk_index, 4);
        assert!(!parsed.success);
    }
}
