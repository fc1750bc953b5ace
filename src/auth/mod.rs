//! Credential verification, lockout, replay guard, and token issuance (§4.3).

use crate::audit::AuditLog;
use crate::common::config::AuthConfig;
use crate::common::error::{Result, TransferError};
use crate::common::model::{AuditOperation, AuditOutcome, AuthToken, FailedAttemptBucket};
use crate::credentials::CredentialStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Validates credentials, enforces lockout, and issues short-lived tokens.
pub struct AuthService {
    credentials: Arc<CredentialStore>,
    audit: Arc<AuditLog>,
    config: AuthConfig,
    buckets: DashMap<String, FailedAttemptBucket>,
    tokens: DashMap<String, AuthToken>,
}

impl AuthService {
    pub fn new(credentials: Arc<CredentialStore>, audit: Arc<AuditLog>, config: AuthConfig) -> Self {
        Self {
            credentials,
            audit,
            config,
            buckets: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    /// Authenticates a client, enforcing the replay guard, lockout, and
    /// constant-time secret comparison described in §4.3. On success,
    /// returns `(tokenId, expiresAt, permissions)`.
    pub async fn authenticate(
        &self,
        client_id: &str,
        secret: &[u8],
        request_timestamp: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>, BTreeSet<String>)> {
        let started = std::time::Instant::now();
        let now = Utc::now();

        let result = self.authenticate_inner(client_id, secret, request_timestamp, now).await;

        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.audit
            .log_event(crate::common::model::AuditEvent {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: now,
                client_id: Some(client_id.to_string()),
                operation: AuditOperation::Authenticate,
                outcome,
                error_code: result.as_ref().err().map(error_code),
                error_message: None,
                source_address: None,
                duration_millis: started.elapsed().as_millis() as u64,
            })
            .await;

        result
    }

    async fn authenticate_inner(
        &self,
        client_id: &str,
        secret: &[u8],
        request_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>, BTreeSet<String>)> {
        let drift = (now - request_timestamp).num_seconds().abs();
        if drift > self.config.replay_window.as_secs() as i64 {
            self.record_failure(client_id, now);
            return Err(TransferError::Auth);
        }

        if self.locked_out(client_id, now) {
            return Err(TransferError::LockedOut {
                retry_after_secs: self.config.lockout_duration.as_secs(),
            });
        }

        let record = match self.credentials.get(client_id).await {
            Ok(r) => r,
            Err(_) => {
                self.record_failure(client_id, now);
                return Err(TransferError::Auth);
            }
        };

        if !record.is_usable_at(now) {
            self.record_failure(client_id, now);
            return Err(TransferError::Auth);
        }

        let candidate_hash = hash_secret(secret, &record.salt);
        if candidate_hash.ct_eq(&record.secret_hash).unwrap_u8() != 1 {
            self.record_failure(client_id, now);
            return Err(TransferError::Auth);
        }

        self.buckets.remove(client_id);

        let token_id = mint_token_id();
        let expires_at = now + ChronoDuration::from_std(self.config.token_ttl).unwrap();
        let token = AuthToken {
            token_id: token_id.clone(),
            client_id: client_id.to_string(),
            permissions: record.permissions.clone(),
            issued_at: now,
            expires_at,
            last_used_at: now,
        };
        let permissions = token.permissions.clone();
        self.tokens.insert(token_id.clone(), token);

        info!(client_id, "authentication succeeded");
        Ok((token_id, expires_at, permissions))
    }

    /// Looks up a previously issued token, rejecting it if expired.
    pub async fn introspect(&self, token_id: &str) -> Result<AuthToken> {
        let now = Utc::now();
        let mut entry = self
            .tokens
            .get_mut(token_id)
            .ok_or(TransferError::TokenExpired)?;
        if entry.is_expired_at(now) {
            drop(entry);
            self.tokens.remove(token_id);
            return Err(TransferError::TokenExpired);
        }
        entry.last_used_at = now;
        Ok(entry.clone())
    }

    fn locked_out(&self, client_id: &str, now: DateTime<Utc>) -> bool {
        let Some(bucket) = self.buckets.get(client_id) else {
            return false;
        };
        let lockout_secs = self.config.lockout_duration.as_secs() as i64;
        bucket.count >= self.config.max_attempts && (now - bucket.last_at).num_seconds() < lockout_secs
    }

    fn record_failure(&self, client_id: &str, now: DateTime<Utc>) {
        self.buckets
            .entry(client_id.to_string())
            .and_modify(|bucket| {
                bucket.count += 1;
                bucket.last_at = now;
            })
            .or_insert(FailedAttemptBucket {
                count: 1,
                first_at: now,
                last_at: now,
            });
    }

    /// Starts the background sweep that purges attempt buckets idle longer
    /// than `2 * lockoutDuration`, running until `cancel` fires.
    pub fn spawn_background_tasks(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let idle_limit = service.config.lockout_duration * 2;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(service.config.lockout_duration) => {
                        let now = Utc::now();
                        let idle_secs = idle_limit.as_secs() as i64;
                        service.buckets.retain(|_, bucket| (now - bucket.last_at).num_seconds() < idle_secs);
                        warn!(remaining = service.buckets.len(), "swept idle attempt buckets");
                    }
                }
            }
        })
    }
}

fn hash_secret(secret: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().to_vec()
}

fn mint_token_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn error_code(err: &TransferError) -> String {
    match err {
        TransferError::Auth => "auth_error".into(),
        TransferError::LockedOut { .. } => "locked_out".into(),
        TransferError::TokenExpired => "token_expired".into(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::AuditConfig;
    use crate::common::model::ClientRecord;
    use std::collections::BTreeSet;
    use std::time::Duration;

    async fn make_service(max_attempts: u32, lockout: Duration) -> (Arc<AuthService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let creds = Arc::new(
            CredentialStore::new(dir.path().join("creds.bin"), b"a very secret passphrase!!".to_vec()).unwrap(),
        );
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl"), AuditConfig::default()));

        let salt = b"saltsalt".to_vec();
        let secret_hash = hash_secret(b"correct-secret", &salt);
        creds
            .put(ClientRecord {
                client_id: "c1".into(),
                secret_hash,
                salt,
                display_name: "tester".into(),
                permissions: BTreeSet::from(["transfer".to_string()]),
                active: true,
                created_at: Utc::now(),
                expires_at: None,
                generation: 0,
            })
            .await
            .unwrap();

        let config = AuthConfig {
            max_attempts,
            lockout_duration: lockout,
            token_ttl: Duration::from_secs(3600),
            replay_window: Duration::from_secs(300),
        };
        (Arc::new(AuthService::new(creds, audit, config)), dir)
    }

    #[tokio::test]
    async fn correct_secret_mints_token() {
        let (service, _dir) = make_service(5, Duration::from_secs(300)).await;
        let (token_id, expires_at, perms) = service
            .authenticate("c1", b"correct-secret", Utc::now())
            .await
            .unwrap();
        assert!(!token_id.is_empty());
        assert!(expires_at > Utc::now());
        assert!(perms.contains("transfer"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (service, _dir) = make_service(5, Duration::from_secs(300)).await;
        let err = service.authenticate("c1", b"wrong-secret", Utc::now()).await.unwrap_err();
        assert!(matches!(err, TransferError::Auth));
    }

    #[tokio::test]
    async fn lockout_after_max_attempts_short_circuits() {
        let (service, _dir) = make_service(3, Duration::from_secs(300)).await;
        for _ in 0..3 {
            let _ = service.authenticate("c1", b"wrong-secret", Utc::now()).await;
        }
        let err = service.authenticate("c1", b"correct-secret", Utc::now()).await.unwrap_err();
        assert!(matches!(err, TransferError::LockedOut { .. }));
    }

    #[tokio::test]
    async fn stale_request_timestamp_is_rejected_as_replay() {
        let (service, _dir) = make_service(5, Duration::from_secs(300)).await;
        let stale = Utc::now() - ChronoDuration::minutes(6);
        let err = service.authenticate("c1", b"correct-secret", stale).await.unwrap_err();
        assert!(matches!(err, TransferError::Auth));
    }

    #[tokio::test]
    async fn introspect_unknown_token_is_expired() {
        let (service, _dir) = make_service(5, Duration::from_secs(300)).await;
        let err = service.introspect("nonexistent").await.unwrap_err();
        assert!(matches!(err, TransferError::TokenExpired));
    }
}
