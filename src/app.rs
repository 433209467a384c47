//! Composition root.
//!
//! [`FileHost`] builds every service from a [`Config`] and owns the background
//! jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::datetime::{Clock, SystemClock};
use crate::db::Database;
use crate::file::{FileService, LocalStorage, StorageBackend};
use crate::maintenance::{
    ExpirationSweeper, JobKind, JobRunner, Optimizer, OptimizerOptions, ResourceMonitor,
};
use crate::rate_limit::{GatedUploads, UploadRateLimiter};
use crate::upload::UploadSessionManager;
use crate::Result;

/// How often idle rate-limit entries are dropped.
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// A fully wired file host.
#[derive(Debug, Clone)]
pub struct FileHost {
    config: Config,
    db: Database,
    files: FileService,
    uploads: UploadSessionManager,
    gated: GatedUploads,
    limiter: Option<Arc<UploadRateLimiter>>,
    sweeper: ExpirationSweeper,
    optimizer: Optimizer,
    jobs: JobRunner,
}

impl FileHost {
    /// Open the database and storage named in `config` and wire the services.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.database.path).await?;
        let storage = LocalStorage::new(&config.storage.path).await?;
        info!(
            database = %config.database.path,
            storage = %config.storage.path,
            "File host opened"
        );
        Ok(Self::with_parts(
            config.clone(),
            db,
            Arc::new(storage),
            Arc::new(SystemClock),
        ))
    }

    /// Wire the services around existing parts.
    pub fn with_parts(
        config: Config,
        db: Database,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let files = FileService::new(
            db.pool().clone(),
            storage,
            clock.clone(),
            config.uploads.limits(),
        );
        let uploads = UploadSessionManager::new(files.clone());

        let limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(UploadRateLimiter::new(&config.rate_limit)));
        let gated = GatedUploads::new(uploads.clone(), files.clone(), limiter.clone());

        let sweeper = ExpirationSweeper::new(
            files.clone(),
            uploads.clone(),
            config.sweeper.batch_size,
        );
        let optimizer = Optimizer::new(
            db.clone(),
            files.clone(),
            uploads.clone(),
            OptimizerOptions::from(&config.optimizer),
        );
        let jobs = JobRunner::new(sweeper.clone(), optimizer.clone(), clock);

        Self {
            config,
            db,
            files,
            uploads,
            gated,
            limiter,
            sweeper,
            optimizer,
            jobs,
        }
    }

    /// Configuration the host was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metadata database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Single-shot uploads, downloads and deletes.
    pub fn files(&self) -> &FileService {
        &self.files
    }

    /// Chunked uploads, without rate limiting.
    pub fn uploads(&self) -> &UploadSessionManager {
        &self.uploads
    }

    /// Upload entry points behind per-client quotas.
    pub fn gated(&self) -> &GatedUploads {
        &self.gated
    }

    /// Expiration sweeper, for running a pass by hand.
    pub fn sweeper(&self) -> &ExpirationSweeper {
        &self.sweeper
    }

    /// Storage and metadata optimizer.
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Host and store resource monitor.
    pub fn monitor(&self) -> &ResourceMonitor {
        self.optimizer.monitor()
    }

    /// Background job runner.
    pub fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    /// Spawn the periodic jobs enabled in the configuration.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.sweeper.enabled {
            handles.push(self.jobs.spawn_periodic(
                JobKind::Sweep,
                Duration::from_secs(self.config.sweeper.interval_secs),
            ));
        }
        if self.config.optimizer.enabled {
            handles.push(self.jobs.spawn_periodic(
                JobKind::OptimizeLight,
                Duration::from_secs(self.config.optimizer.light_interval_secs),
            ));
            handles.push(self.jobs.spawn_periodic(
                JobKind::OptimizeAggressive,
                Duration::from_secs(self.config.optimizer.aggressive_interval_secs),
            ));
        }
        if let Some(limiter) = &self.limiter {
            handles.push(limiter.clone().start_cleanup_task(RATE_LIMIT_CLEANUP_INTERVAL));
        }

        info!(tasks = handles.len(), "Background jobs started");
        handles
    }

    /// Close the database pool.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
