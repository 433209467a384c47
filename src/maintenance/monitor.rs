//! Host and store resource monitoring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sysinfo::{Disks, System};

use crate::file::{FileRecordRepository, FileService, StorageBackend};
use crate::upload::UploadSessionRepository;
use crate::{FileHostError, Result};

/// Point-in-time resource usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Host memory in bytes.
    pub total_memory: u64,
    /// Host memory available in bytes.
    pub available_memory: u64,
    /// Size of the disk holding the storage root, if it could be determined.
    pub disk_total: Option<u64>,
    /// Free space on that disk.
    pub disk_available: Option<u64>,
    /// Content objects in storage.
    pub object_count: u64,
    /// Bytes held by content objects.
    pub object_bytes: u64,
    /// File records in the metadata store.
    pub file_records: u64,
    /// Open upload sessions.
    pub active_sessions: u64,
}

impl ResourceSnapshot {
    /// Disk usage of the storage volume in percent.
    pub fn disk_usage_percent(&self) -> Option<f64> {
        match (self.disk_total, self.disk_available) {
            (Some(total), Some(available)) if total > 0 => {
                Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HostStats {
    total_memory: u64,
    available_memory: u64,
    disk_total: Option<u64>,
    disk_available: Option<u64>,
}

/// Collects [`ResourceSnapshot`]s.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    files: FileService,
}

impl ResourceMonitor {
    /// Create a monitor over the stores behind `files`.
    pub fn new(files: FileService) -> Self {
        Self { files }
    }

    fn storage(&self) -> &Arc<dyn StorageBackend> {
        self.files.storage()
    }

    /// Take a snapshot.
    ///
    /// sysinfo calls block, so they run on the blocking pool.
    pub async fn snapshot(&self) -> Result<ResourceSnapshot> {
        let root = self.storage().root().map(Path::to_path_buf);
        let host = tokio::task::spawn_blocking(move || host_stats(root.as_deref()))
            .await
            .map_err(|e| FileHostError::Io(std::io::Error::other(e)))?;

        let objects = self.storage().list_objects().await?;
        let pool = self.files.pool();
        Ok(ResourceSnapshot {
            total_memory: host.total_memory,
            available_memory: host.available_memory,
            disk_total: host.disk_total,
            disk_available: host.disk_available,
            object_count: objects.len() as u64,
            object_bytes: objects.iter().map(|o| o.size).sum(),
            file_records: FileRecordRepository::new(pool).count().await?,
            active_sessions: UploadSessionRepository::new(pool).count().await?,
        })
    }
}

fn host_stats(root: Option<&Path>) -> HostStats {
    let mut system = System::new();
    system.refresh_memory();

    let mut stats = HostStats {
        total_memory: system.total_memory(),
        available_memory: system.available_memory(),
        ..HostStats::default()
    };

    if let Some(root) = root {
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| PathBuf::from(root));
        let disks = Disks::new_with_refreshed_list();
        // Longest mount point containing the root wins.
        if let Some(disk) = disks
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
        {
            stats.disk_total = Some(disk.total_space());
            stats.disk_available = Some(disk.available_space());
        }
    }
    stats
}
