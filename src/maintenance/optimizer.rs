//! Storage and metadata optimizer.
//!
//! A light run reaps data nothing points at any more: content objects without
//! a file record, chunk directories without a session, and writer temp files
//! left by crashed writes. Anything modified within the safety margin is left
//! alone, since it may belong to a write still in flight. An aggressive run
//! also removes empty shard directories, compacts the database and spot-checks
//! stored checksums.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::monitor::{ResourceMonitor, ResourceSnapshot};
use crate::config::OptimizerConfig;
use crate::datetime::sub_duration;
use crate::db::Database;
use crate::file::{FileRecordRepository, FileService, StorageBackend};
use crate::upload::{UploadSessionManager, UploadSessionRepository};

/// Which optimizer pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeMode {
    /// Orphan reaping and monitoring.
    Light,
    /// Light scope plus compaction and verification.
    Aggressive,
}

/// Optimizer tuning.
#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    /// Unreferenced data younger than this is kept.
    pub safety_margin: Duration,
    /// Records re-hashed per aggressive run.
    pub verify_sample: u32,
    /// Disk usage (percent) that triggers a warning.
    pub disk_usage_warn_percent: f64,
}

impl From<&OptimizerConfig> for OptimizerOptions {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            safety_margin: Duration::from_secs(config.safety_margin_secs),
            verify_sample: config.verify_sample,
            disk_usage_warn_percent: config.disk_usage_warn_percent,
        }
    }
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self::from(&OptimizerConfig::default())
    }
}

/// What an optimizer run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizeReport {
    pub mode: OptimizeMode,
    pub orphan_objects_removed: u64,
    pub orphan_chunk_sessions_removed: u64,
    pub temp_files_removed: u64,
    pub locks_pruned: u64,
    pub empty_dirs_removed: u64,
    pub compacted: bool,
    pub files_verified: u64,
    /// File ids whose stored bytes no longer match their checksum.
    pub corrupt_files: Vec<String>,
    /// Steps or items that failed; details are in the log.
    pub failures: u64,
    pub snapshot: Option<ResourceSnapshot>,
}

impl OptimizeReport {
    fn new(mode: OptimizeMode) -> Self {
        Self {
            mode,
            orphan_objects_removed: 0,
            orphan_chunk_sessions_removed: 0,
            temp_files_removed: 0,
            locks_pruned: 0,
            empty_dirs_removed: 0,
            compacted: false,
            files_verified: 0,
            corrupt_files: Vec::new(),
            failures: 0,
            snapshot: None,
        }
    }
}

/// Runs light and aggressive optimization passes.
#[derive(Debug, Clone)]
pub struct Optimizer {
    db: Database,
    files: FileService,
    uploads: UploadSessionManager,
    monitor: ResourceMonitor,
    options: OptimizerOptions,
}

impl Optimizer {
    /// Create an optimizer.
    pub fn new(
        db: Database,
        files: FileService,
        uploads: UploadSessionManager,
        options: OptimizerOptions,
    ) -> Self {
        Self {
            monitor: ResourceMonitor::new(files.clone()),
            db,
            files,
            uploads,
            options,
        }
    }

    /// The monitor used for snapshots.
    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    fn storage(&self) -> &Arc<dyn StorageBackend> {
        self.files.storage()
    }

    /// Light pass at `now`.
    pub async fn run_light(&self, now: DateTime<Utc>) -> OptimizeReport {
        let mut report = OptimizeReport::new(OptimizeMode::Light);
        self.light_steps(now, &mut report).await;
        log_report(&report);
        report
    }

    /// Aggressive pass at `now`.
    pub async fn run_aggressive(&self, now: DateTime<Utc>) -> OptimizeReport {
        let mut report = OptimizeReport::new(OptimizeMode::Aggressive);
        self.light_steps(now, &mut report).await;

        match self.storage().remove_empty_dirs().await {
            Ok(n) => report.empty_dirs_removed = n as u64,
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Failed to remove empty directories");
            }
        }

        match self.db.compact().await {
            Ok(()) => report.compacted = true,
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Database compaction failed");
            }
        }

        self.verify_sample(&mut report).await;
        log_report(&report);
        report
    }

    async fn light_steps(&self, now: DateTime<Utc>, report: &mut OptimizeReport) {
        let cutoff = sub_duration(now, self.options.safety_margin);
        self.reap_orphan_objects(cutoff, report).await;
        self.reap_orphan_chunks(cutoff, report).await;
        self.reap_temp_files(cutoff, report).await;

        report.locks_pruned =
            (self.uploads.locks().prune() + self.files.content_locks().prune()) as u64;

        match self.monitor.snapshot().await {
            Ok(snapshot) => {
                if let Some(usage) = snapshot.disk_usage_percent() {
                    if usage >= self.options.disk_usage_warn_percent {
                        warn!(
                            usage_percent = usage,
                            threshold = self.options.disk_usage_warn_percent,
                            "Storage disk usage is high"
                        );
                    }
                }
                report.snapshot = Some(snapshot);
            }
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Failed to take resource snapshot");
            }
        }
    }

    async fn reap_orphan_objects(&self, cutoff: DateTime<Utc>, report: &mut OptimizeReport) {
        let records = FileRecordRepository::new(self.files.pool());
        let (objects, referenced) = match tokio::try_join!(
            self.storage().list_objects(),
            records.storage_paths(),
        ) {
            Ok(found) => found,
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Failed to scan for orphaned objects");
                return;
            }
        };

        for object in objects {
            if referenced.contains(&object.key) || object.modified >= cutoff {
                continue;
            }
            match self.files.remove_orphan_object(&object.key).await {
                Ok(true) => {
                    report.orphan_objects_removed += 1;
                    debug!(key = %object.key, size = object.size, "Removed orphaned object");
                }
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(key = %object.key, error = %e, "Failed to remove orphaned object");
                }
            }
        }
    }

    async fn reap_orphan_chunks(&self, cutoff: DateTime<Utc>, report: &mut OptimizeReport) {
        let session_repo = UploadSessionRepository::new(self.files.pool());
        let (chunk_sets, sessions) = match tokio::try_join!(
            self.storage().list_chunk_sessions(),
            session_repo.session_ids(),
        ) {
            Ok(found) => found,
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Failed to scan for orphaned chunks");
                return;
            }
        };

        for set in chunk_sets {
            if sessions.contains(&set.key) || set.modified >= cutoff {
                continue;
            }
            match self.uploads.remove_orphan_chunks(&set.key).await {
                Ok(true) => {
                    report.orphan_chunk_sessions_removed += 1;
                    debug!(session_id = %set.key, size = set.size, "Removed orphaned chunks");
                }
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(session_id = %set.key, error = %e, "Failed to remove orphaned chunks");
                }
            }
        }
    }

    async fn reap_temp_files(&self, cutoff: DateTime<Utc>, report: &mut OptimizeReport) {
        let temp = match self.storage().list_temp().await {
            Ok(temp) => temp,
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Failed to scan temp files");
                return;
            }
        };

        for entry in temp.into_iter().filter(|t| t.modified < cutoff) {
            match self.storage().delete(&entry.key).await {
                Ok(true) => report.temp_files_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(key = %entry.key, error = %e, "Failed to remove stale temp file");
                }
            }
        }
    }

    async fn verify_sample(&self, report: &mut OptimizeReport) {
        if self.options.verify_sample == 0 {
            return;
        }
        let records = match FileRecordRepository::new(self.files.pool())
            .sample(self.options.verify_sample)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "Failed to sample files for verification");
                return;
            }
        };

        for record in records {
            match self.files.verify_record(&record).await {
                Ok(true) => report.files_verified += 1,
                Ok(false) => {
                    report.files_verified += 1;
                    error!(
                        file_id = %record.file_id,
                        key = %record.storage_path,
                        "Stored content does not match its checksum"
                    );
                    report.corrupt_files.push(record.file_id);
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(file_id = %record.file_id, error = %e, "Verification failed");
                }
            }
        }
    }
}

fn log_report(report: &OptimizeReport) {
    info!(
        mode = ?report.mode,
        orphan_objects = report.orphan_objects_removed,
        orphan_chunk_sessions = report.orphan_chunk_sessions_removed,
        temp_files = report.temp_files_removed,
        locks_pruned = report.locks_pruned,
        empty_dirs = report.empty_dirs_removed,
        verified = report.files_verified,
        corrupt = report.corrupt_files.len(),
        failures = report.failures,
        "Optimizer run finished"
    );
}
