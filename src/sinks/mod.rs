//! Named external capabilities the core consumes as explicit parameters
//! rather than ambient globals (§9): storage placement, audit recording,
//! and operator alerting.

use crate::common::error::Result;
use crate::common::model::{AuditEvent, FileDescriptor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Resolves where a finalized transfer should live and whether there's
/// room for it. Retention sweeping and layout policy live entirely on the
/// other side of this contract.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn has_space(&self, size: u64) -> Result<bool>;
    async fn target_path(&self, descriptor: &FileDescriptor) -> Result<PathBuf>;
}

/// Records audit events. `AuditLog` itself satisfies this; it exists as a
/// trait so callers can take a capability rather than a concrete type.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Out-of-band operator notification for conditions worth paging on
/// (e.g. repeated lockouts, storage exhaustion). No default transport is
/// implemented; the core only ever calls this contract.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, message: &str);
}

#[async_trait]
impl AuditSink for crate::audit::AuditLog {
    async fn record(&self, event: AuditEvent) {
        self.log_event(event).await;
    }
}

/// Plain filesystem-backed `StorageSink`: places files under a root
/// directory named by `descriptor.logicalName`, and checks free space via
/// the platform's statvfs-equivalent.
pub struct FilesystemStorageSink {
    root: PathBuf,
}

impl FilesystemStorageSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageSink for FilesystemStorageSink {
    async fn has_space(&self, size: u64) -> Result<bool> {
        let root = self.root.clone();
        let available = tokio::task::spawn_blocking(move || available_space_for(&root))
            .await
            .map_err(|e| crate::common::error::TransferError::Internal(e.into()))?;
        match available {
            Some(available) => Ok(available >= size),
            None => {
                warn!("unable to determine free space for storage root, assuming sufficient");
                Ok(true)
            }
        }
    }

    async fn target_path(&self, descriptor: &FileDescriptor) -> Result<PathBuf> {
        crate::common::validation::validate_logical_name(&descriptor.logical_name)
            .map_err(|e| crate::common::error::TransferError::Protocol(e.to_string()))?;
        Ok(self.root.join(&descriptor.logical_name))
    }
}

/// Finds the disk backing `path` (the mount point with the longest
/// matching prefix) and returns its available bytes.
fn available_space_for(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn filesystem_storage_sink_resolves_target_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemStorageSink::new(dir.path());
        let descriptor = FileDescriptor {
            logical_name: "backup.dump".into(),
            size: 10,
            md5: None,
            sha256: None,
            created_at: Utc::now(),
            source_tag: None,
        };
        let path = sink.target_path(&descriptor).await.unwrap();
        assert_eq!(path, dir.path().join("backup.dump"));
    }

    #[tokio::test]
    async fn filesystem_storage_sink_reports_space_for_small_request() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemStorageSink::new(dir.path());
        assert!(sink.has_space(1024).await.unwrap());
    }
}
