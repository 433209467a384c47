//! Expiration sweeper.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::file::{FileRecordRepository, FileService};
use crate::upload::{UploadSessionManager, UploadSessionRepository};

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// File records deleted.
    pub files_deleted: u64,
    /// Upload sessions deleted.
    pub sessions_deleted: u64,
    /// Items that could not be deleted and stay for the next pass.
    pub failures: u64,
}

impl SweepReport {
    /// Whether the pass deleted nothing.
    pub fn is_empty(&self) -> bool {
        self.files_deleted == 0 && self.sessions_deleted == 0
    }
}

/// Deletes expired files and upload sessions.
#[derive(Debug, Clone)]
pub struct ExpirationSweeper {
    files: FileService,
    uploads: UploadSessionManager,
    batch_size: u32,
}

impl ExpirationSweeper {
    /// Create a sweeper that lists expired items `batch_size` at a time.
    pub fn new(files: FileService, uploads: UploadSessionManager, batch_size: u32) -> Self {
        Self {
            files,
            uploads,
            batch_size: batch_size.max(1),
        }
    }

    /// Run one pass over everything expired at `now`.
    ///
    /// Failures are logged and counted, never returned. Items that fail stay
    /// for the next pass and do not block the ones behind them.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_files(now, &mut report).await;
        self.sweep_sessions(now, &mut report).await;

        if report.is_empty() && report.failures == 0 {
            debug!("Sweep found nothing to delete");
        } else {
            info!(
                files_deleted = report.files_deleted,
                sessions_deleted = report.sessions_deleted,
                failures = report.failures,
                "Sweep finished"
            );
        }
        report
    }

    async fn sweep_files(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let repo = FileRecordRepository::new(self.files.pool());
        let mut after = None;
        loop {
            let page = match repo.list_expired(now, after, self.batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    report.failures += 1;
                    warn!(error = %e, "Failed to list expired files");
                    return;
                }
            };
            let full = page.len() >= self.batch_size as usize;
            after = page
                .last()
                .and_then(|last| last.expires_at.map(|at| (at, last.id)));

            for record in page {
                match self.files.remove_record(&record).await {
                    Ok(true) => {
                        report.files_deleted += 1;
                        debug!(file_id = %record.file_id, "Expired file deleted");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        report.failures += 1;
                        warn!(file_id = %record.file_id, error = %e, "Failed to delete expired file");
                    }
                }
            }

            if !full || after.is_none() {
                return;
            }
        }
    }

    async fn sweep_sessions(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let repo = UploadSessionRepository::new(self.files.pool());
        let mut after: Option<(DateTime<Utc>, String)> = None;
        loop {
            let cursor = after.as_ref().map(|(at, id)| (*at, id.as_str()));
            let page = match repo.list_expired(now, cursor, self.batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    report.failures += 1;
                    warn!(error = %e, "Failed to list expired sessions");
                    return;
                }
            };
            let full = page.len() >= self.batch_size as usize;
            after = page
                .last()
                .map(|last| (last.expires_at, last.session_id.clone()));

            for session in page {
                match self.uploads.purge_expired(&session.session_id, now).await {
                    Ok(true) => report.sessions_deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failures += 1;
                        warn!(
                            session_id = %session.session_id,
                            error = %e,
                            "Failed to delete expired session"
                        );
                    }
                }
            }

            if !full {
                return;
            }
        }
    }
}
