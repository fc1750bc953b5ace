//! Append-only, batched JSON-lines audit log (§4.4).

use crate::common::config::AuditConfig;
use crate::common::error::{Result, TransferError};
use crate::common::model::AuditEvent;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Batched, append-only audit sink. Events are enqueued in-memory and
/// flushed to disk every 30s, every 100 entries, or on shutdown.
pub struct AuditLog {
    path: PathBuf,
    sender: mpsc::UnboundedSender<AuditEvent>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, config: AuditConfig) -> Self {
        let path = path.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(flush_loop(path.clone(), config, receiver, shutdown.clone()));
        Self {
            path,
            sender,
            worker: Mutex::new(Some(worker)),
            shutdown,
        }
    }

    /// Enqueues an event for the next batch flush.
    pub async fn log_event(&self, event: AuditEvent) {
        if self.sender.send(event).is_err() {
            warn!("audit log worker already stopped; dropping event");
        }
    }

    /// Signals the flusher to drain and exit, then waits for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut guard = self.worker.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle.await;
        }
    }

    /// Reads the log file, filtering to `[start, end]` and optionally one
    /// `clientId`, returned sorted ascending by timestamp.
    pub async fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        client_id: Option<&str>,
    ) -> Result<Vec<AuditEvent>> {
        let mut events = read_events(&self.path).await?;
        events.retain(|e| {
            e.timestamp >= start
                && e.timestamp <= end
                && client_id.map(|id| e.client_id.as_deref() == Some(id)).unwrap_or(true)
        });
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    /// Rewrites the file, dropping parseable entries older than `days`.
    /// Unparsable lines are always preserved.
    pub async fn purge_older_than(&self, days: i64) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(TransferError::Internal(e.into())),
        };

        let mut kept = String::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) if event.timestamp < cutoff => continue,
                _ => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }

        atomic_write(&self.path, kept.as_bytes()).await
    }
}

async fn flush_loop(
    path: PathBuf,
    config: AuditConfig,
    mut receiver: mpsc::UnboundedReceiver<AuditEvent>,
    shutdown: CancellationToken,
) {
    let mut buffer = Vec::with_capacity(config.flush_batch_size);
    let mut interval = tokio::time::interval(config.flush_interval);
    interval.tick().await;

    loop {
        tokio::select! {
            maybe_event = receiver.recv() => {
                match maybe_event {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= config.flush_batch_size {
                            flush(&path, &mut buffer).await;
                        }
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&path, &mut buffer).await;
                }
            }
            _ = shutdown.cancelled() => {
                while let Ok(event) = receiver.try_recv() {
                    buffer.push(event);
                }
                flush(&path, &mut buffer).await;
                break;
            }
        }
    }
    flush(&path, &mut buffer).await;
}

async fn flush(path: &Path, buffer: &mut Vec<AuditEvent>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = append_events(path, buffer).await {
        warn!(error = %e, "failed to flush audit log batch");
        return;
    }
    debug!(count = buffer.len(), "flushed audit log batch");
    buffer.clear();
}

async fn append_events(path: &Path, events: &[AuditEvent]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| TransferError::Internal(e.into()))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;

    let mut payload = String::new();
    for event in events {
        let line = serde_json::to_string(event).map_err(|e| TransferError::Internal(e.into()))?;
        payload.push_str(&line);
        payload.push('\n');
    }
    file.write_all(payload.as_bytes()).await.map_err(|e| TransferError::Internal(e.into()))?;
    file.sync_all().await.map_err(|e| TransferError::Internal(e.into()))?;
    Ok(())
}

async fn read_events(path: &Path) -> Result<Vec<AuditEvent>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TransferError::Internal(e.into())),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut events = Vec::new();
    while let Some(line) = lines.next_line().await.map_err(|e| TransferError::Internal(e.into()))? {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
            events.push(event);
        }
    }
    Ok(events)
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await.map_err(|e| TransferError::Internal(e.into()))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("audit")
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
    use crate::common::model::{AuditOperation, AuditOutcome};
    use std::time::Duration;

    fn sample_event(client_id: &str, timestamp: DateTime<Utc>) -> AuditEvent {
        AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            client_id: Some(client_id.to_string()),
            operation: AuditOperation::Authenticate,
            outcome: AuditOutcome::Success,
            error_code: None,
            error_message: None,
            source_address: None,
            duration_millis: 5,
        }
    }

    #[tokio::test]
    async fn flushes_on_batch_size_and_is_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            flush_interval: Duration::from_secs(3600),
            flush_batch_size: 2,
        };
        let log = AuditLog::new(dir.path().join("audit.jsonl"), config);
        let now = Utc::now();
        log.log_event(sample_event("c1", now)).await;
        log.log_event(sample_event("c2", now)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = log
            .between(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1), None)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        log.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            flush_interval: Duration::from_secs(3600),
            flush_batch_size: 100,
        };
        let log = AuditLog::new(dir.path().join("audit.jsonl"), config);
        let now = Utc::now();
        log.log_event(sample_event("c1", now)).await;
        log.shutdown().await;

        let events = log
            .between(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1), None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn between_filters_by_client_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            flush_interval: Duration::from_secs(3600),
            flush_batch_size: 100,
        };
        let log = AuditLog::new(dir.path().join("audit.jsonl"), config);
        let now = Utc::now();
        log.log_event(sample_event("c1", now)).await;
        log.log_event(sample_event("c2", now)).await;
        log.shutdown().await;

        let events = log
            .between(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1), Some("c1"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn purge_older_than_keeps_unparsable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let old_event = sample_event("c1", Utc::now() - chrono::Duration::days(40));
        let mut content = serde_json::to_string(&old_event).unwrap();
        content.push('\n');
        content.push_str("not valid json\n");
        tokio::fs::write(&path, content).await.unwrap();

        let config = AuditConfig::default();
        let log = AuditLog::new(&path, config);
        log.purge_older_than(30).await.unwrap();
        log.shutdown().await;

        let remaining = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(remaining.contains("not valid json"));
        assert!(!remaining.contains(&old_event.id));
    }
}
