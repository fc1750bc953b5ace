//! Runtime configuration tree. Deliberately a plain constructible struct
//! with sane `local()`/`tunnel()`-style presets, matching the teacher's
//! `TransferConfig` — a file/env loader is out of scope (§1 Non-goals);
//! this is the shape such a loader would populate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chunking + concurrency knobs for one transfer.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TransferSettings {
    pub chunk_size: u64,
    pub concurrency: usize,
}

impl TransferSettings {
    pub fn local() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            concurrency: 8,
        }
    }

    pub fn tunnel() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            concurrency: 2,
        }
    }
}

/// Auth service tuning.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub max_attempts: u32,
    pub lockout_duration: Duration,
    pub token_ttl: Duration,
    pub replay_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_duration: Duration::from_secs(5 * 60),
            token_ttl: Duration::from_secs(60 * 60),
            replay_window: Duration::from_secs(5 * 60),
        }
    }
}

/// Audit log batching tuning.
#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub flush_interval: Duration,
    pub flush_batch_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            flush_batch_size: 100,
        }
    }
}

/// Resume-store TTL tuning.
#[derive(Clone, Debug)]
pub struct ResumeConfig {
    pub ttl: Duration,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Server framing limits (§4.7).
#[derive(Clone, Debug)]
pub struct FrameLimits {
    pub max_control_frame: u32,
    pub max_chunk_frame: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_control_frame: 1024 * 1024,
            max_chunk_frame: 100 * 1024 * 1024,
        }
    }
}

/// Server graceful-shutdown grace period.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Client retry/backoff tuning.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// `base * 2^(attempt-1)`, capped at `max_backoff`. `attempt` is 1-based.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.base_backoff.as_millis() as u64;
        let computed = millis.saturating_mul(factor);
        Duration::from_millis(computed).min(self.max_backoff)
    }
}
