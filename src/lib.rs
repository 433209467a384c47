//! filehost - file hosting backend
//!
//! Single-shot and chunked resumable uploads into content-addressed storage,
//! with expiring file records, an expiration sweeper and a storage optimizer.

pub mod app;
pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod file;
pub mod locks;
pub mod logging;
pub mod maintenance;
pub mod rate_limit;
pub mod upload;

pub use app::FileHost;
pub use config::Config;
pub use datetime::{Clock, ManualClock, SystemClock};
pub use db::Database;
pub use error::{FileHostError, Result};
pub use file::{
    FileRecord, FileService, LocalStorage, ObjectWriter, Retention, StorageBackend, StoreFile,
    UploadLimits,
};
pub use locks::KeyedLocks;
pub use maintenance::{
    ExpirationSweeper, JobKind, JobOutcome, JobRunner, OptimizeReport, Optimizer,
    ResourceMonitor, ResourceSnapshot, SweepReport,
};
pub use rate_limit::{GatedUploads, UploadRateLimiter};
pub use upload::{ChunkAccepted, CreateSession, SessionStatus, UploadSession, UploadSessionManager};
