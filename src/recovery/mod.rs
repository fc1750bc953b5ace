//! Central timeout/retry hammer (§4.9): every network and service call is
//! wrapped with a deadline, and every observed fault is classified into a
//! retry decision via one small table.

use crate::common::config::RetryConfig;
use crate::common::error::{Result, TransferError};
use std::future::Future;
use std::time::{Duration, Instant};

/// What a caller should do after observing a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Non-retryable; propagate to the caller as-is.
    Surface,
    /// Retry the same chunk exactly once, then surface if it fails again.
    RetryChunkOnce,
    /// Retry the whole attempt with exponential backoff.
    RetryWithBackoff,
}

/// Wraps external calls with a deadline and classifies the faults they
/// produce into retry decisions.
pub struct RecoveryCoordinator {
    retry: RetryConfig,
}

impl RecoveryCoordinator {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Runs `op` under a deadline, translating an elapsed deadline into a
    /// `TransferError::Timeout` carrying both the configured and measured
    /// duration.
    pub async fn with_deadline<F, T>(&self, operation: &str, timeout: Duration, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout {
                operation: operation.to_string(),
                configured_ms: timeout.as_millis() as u64,
                actual_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// The §4.9/§7 fault taxonomy decision table. `resume_token_present`
    /// distinguishes the two `TimeoutError`/`TransportError` rows that
    /// depend on whether a resume handle exists for the in-flight transfer.
    pub fn decide(&self, error: &TransferError, resume_token_present: bool) -> Decision {
        match error {
            TransferError::Timeout { .. } => {
                if resume_token_present {
                    Decision::RetryWithBackoff
                } else {
                    Decision::Surface
                }
            }
            TransferError::Checksum { .. } => Decision::RetryChunkOnce,
            TransferError::Integrity { .. } => Decision::Surface,
            TransferError::Order { .. } => Decision::Surface,
            TransferError::Auth | TransferError::Authz | TransferError::TokenExpired | TransferError::LockedOut { .. } => {
                Decision::Surface
            }
            TransferError::StorageFull => Decision::Surface,
            TransferError::Transport(_) => Decision::RetryWithBackoff,
            TransferError::Protocol(_)
            | TransferError::NotFound(_)
            | TransferError::Conflict(_)
            | TransferError::Unavailable(_)
            | TransferError::Internal(_) => Decision::Surface,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_deadline_surfaces_timeout_with_measured_duration() {
        let coordinator = RecoveryCoordinator::new(RetryConfig::default());
        let result: Result<()> = coordinator
            .with_deadline("chunk-read", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await;
        match result {
            Err(TransferError::Timeout { configured_ms, actual_ms, .. }) => {
                assert_eq!(configured_ms, 10);
                assert!(actual_ms >= 10);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn with_deadline_passes_through_fast_success() {
        let coordinator = RecoveryCoordinator::new(RetryConfig::default());
        let result = coordinator
            .with_deadline("noop", Duration::from_secs(1), async { Ok::<_, TransferError>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn decide_matches_fault_taxonomy_table() {
        let coordinator = RecoveryCoordinator::new(RetryConfig::default());

        let timeout = TransferError::Timeout {
            operation: "transfer".into(),
            configured_ms: 1000,
            actual_ms: 1001,
        };
        assert_eq!(coordinator.decide(&timeout, true), Decision::RetryWithBackoff);
        assert_eq!(coordinator.decide(&timeout, false), Decision::Surface);

        assert_eq!(coordinator.decide(&TransferError::Checksum { chunk_index: 2 }, false), Decision::RetryChunkOnce);
        assert_eq!(
            coordinator.decide(&TransferError::Integrity { expected: "a".into(), actual: "b".into() }, true),
            Decision::Surface
        );
        assert_eq!(coordinator.decide(&TransferError::Order { expected: 1, got: 3 }, true), Decision::Surface);
        assert_eq!(coordinator.decide(&TransferError::Auth, true), Decision::Surface);
        assert_eq!(coordinator.decide(&TransferError::StorageFull, true), Decision::Surface);
        assert_eq!(coordinator.decide(&TransferError::Transport("reset".into()), false), Decision::RetryWithBackoff);
    }
}
