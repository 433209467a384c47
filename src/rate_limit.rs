//! Per-client rate limiting for uploads.
//!
//! [`UploadRateLimiter`] keeps one keyed `governor` limiter per action.
//! [`GatedUploads`] wraps the upload entry points and checks the caller's
//! quota before any work is done; the core services know nothing about
//! clients or quotas.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::io::AsyncRead;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::file::{FileRecord, FileService, ObjectReader, StoreFile};
use crate::upload::{
    ChunkAccepted, CreateSession, SessionStatus, UploadSession, UploadSessionManager,
};
use crate::{FileHostError, Result};

/// Rate-limited upload actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    /// Opening an upload session.
    CreateSession,
    /// Sending a chunk or asking for assembly.
    Chunk,
    /// Single-shot upload.
    Upload,
}

impl UploadAction {
    fn as_str(self) -> &'static str {
        match self {
            UploadAction::CreateSession => "create_session",
            UploadAction::Chunk => "chunk",
            UploadAction::Upload => "upload",
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Action is allowed.
    Allowed,
    /// Action is denied due to rate limit.
    Denied {
        /// Time until the quota allows another request.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Check if the action is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Per-client quotas for upload actions.
///
/// # Example
///
/// ```
/// use filehost::config::RateLimitConfig;
/// use filehost::rate_limit::{UploadAction, UploadRateLimiter};
///
/// let config = RateLimitConfig {
///     sessions_per_minute: 1,
///     ..RateLimitConfig::default()
/// };
/// let limiter = UploadRateLimiter::new(&config);
///
/// assert!(limiter.check(UploadAction::CreateSession, "10.0.0.1").is_allowed());
/// assert!(!limiter.check(UploadAction::CreateSession, "10.0.0.1").is_allowed());
/// assert!(limiter.check(UploadAction::CreateSession, "10.0.0.2").is_allowed());
/// ```
pub struct UploadRateLimiter {
    sessions: DefaultKeyedRateLimiter<String>,
    chunks: DefaultKeyedRateLimiter<String>,
    uploads: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
}

fn per_minute(n: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN))
}

impl UploadRateLimiter {
    /// Create a limiter from configuration. The `enabled` flag is left to the caller.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            sessions: RateLimiter::keyed(per_minute(config.sessions_per_minute)),
            chunks: RateLimiter::keyed(per_minute(config.chunks_per_minute)),
            uploads: RateLimiter::keyed(per_minute(config.uploads_per_minute)),
            clock: DefaultClock::default(),
        }
    }

    fn limiter(&self, action: UploadAction) -> &DefaultKeyedRateLimiter<String> {
        match action {
            UploadAction::CreateSession => &self.sessions,
            UploadAction::Chunk => &self.chunks,
            UploadAction::Upload => &self.uploads,
        }
    }

    /// Consume one unit of `client`'s quota for `action`.
    pub fn check(&self, action: UploadAction, client: &str) -> RateLimitResult {
        match self.limiter(action).check_key(&client.to_string()) {
            Ok(()) => RateLimitResult::Allowed,
            Err(not_until) => RateLimitResult::Denied {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }

    /// Forget clients whose quotas have fully replenished.
    pub fn cleanup(&self) {
        for limiter in [&self.sessions, &self.chunks, &self.uploads] {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Number of clients tracked across all actions.
    pub fn tracked_clients(&self) -> usize {
        self.sessions.len() + self.chunks.len() + self.uploads.len()
    }

    /// Start a background task that periodically calls [`cleanup`](Self::cleanup).
    pub fn start_cleanup_task(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                self.cleanup();
            }
        })
    }
}

impl std::fmt::Debug for UploadRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRateLimiter")
            .field("tracked_clients", &self.tracked_clients())
            .finish()
    }
}

/// Upload entry points behind per-client quotas.
///
/// With no limiter every call goes straight through.
#[derive(Debug, Clone)]
pub struct GatedUploads {
    uploads: UploadSessionManager,
    files: FileService,
    limiter: Option<Arc<UploadRateLimiter>>,
}

impl GatedUploads {
    /// Wrap the upload services.
    pub fn new(
        uploads: UploadSessionManager,
        files: FileService,
        limiter: Option<Arc<UploadRateLimiter>>,
    ) -> Self {
        Self {
            uploads,
            files,
            limiter,
        }
    }

    /// The limiter, if quotas are enforced.
    pub fn limiter(&self) -> Option<&Arc<UploadRateLimiter>> {
        self.limiter.as_ref()
    }

    fn gate(&self, action: UploadAction, client: &str) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        match limiter.check(action, client) {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::Denied { retry_after } => {
                warn!(
                    client,
                    action = action.as_str(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Upload rate limit exceeded"
                );
                Err(FileHostError::RateLimited { retry_after })
            }
        }
    }

    /// Open an upload session for `client`.
    pub async fn create_session(&self, client: &str, request: CreateSession) -> Result<UploadSession> {
        self.gate(UploadAction::CreateSession, client)?;
        self.uploads.create_session(request).await
    }

    /// Accept a chunk from `client`.
    pub async fn accept_chunk(
        &self,
        client: &str,
        session_id: &str,
        index: u64,
        bytes: &[u8],
    ) -> Result<ChunkAccepted> {
        self.gate(UploadAction::Chunk, client)?;
        self.uploads.accept_chunk(session_id, index, bytes).await
    }

    /// Assemble `client`'s upload if it is complete. Counts against the chunk quota.
    pub async fn finalize_if_complete(
        &self,
        client: &str,
        session_id: &str,
    ) -> Result<Option<FileRecord>> {
        self.gate(UploadAction::Chunk, client)?;
        self.uploads.finalize_if_complete(session_id).await
    }

    /// Single-shot upload from `client`.
    pub async fn store_file<R>(
        &self,
        client: &str,
        reader: &mut R,
        request: StoreFile,
    ) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.gate(UploadAction::Upload, client)?;
        self.files.store_file(reader, request).await
    }

    /// Cancel a session. Not rate limited.
    pub async fn cancel_session(&self, session_id: &str) -> Result<bool> {
        self.uploads.cancel_session(session_id).await
    }

    /// Session progress. Not rate limited.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        self.uploads.session_status(session_id).await
    }

    /// Download path. Not rate limited.
    pub async fn open_file(&self, file_id: &str) -> Result<(FileRecord, ObjectReader)> {
        self.files.open_file(file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime::SystemClock;
    use crate::file::{LocalStorage, UploadLimits};
    use crate::Database;
    use tempfile::TempDir;

    fn config(sessions: u32, chunks: u32, uploads: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            sessions_per_minute: sessions,
            chunks_per_minute: chunks,
            uploads_per_minute: uploads,
        }
    }

    #[test]
    fn test_quota_per_client() {
        let limiter = UploadRateLimiter::new(&config(2, 100, 100));

        assert!(limiter.check(UploadAction::CreateSession, "a").is_allowed());
        assert!(limiter.check(UploadAction::CreateSession, "a").is_allowed());
        match limiter.check(UploadAction::CreateSession, "a") {
            RateLimitResult::Denied { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(30));
            }
            RateLimitResult::Allowed => panic!("third session should be denied"),
        }

        // Other clients and other actions have their own budget
        assert!(limiter.check(UploadAction::CreateSession, "b").is_allowed());
        assert!(limiter.check(UploadAction::Chunk, "a").is_allowed());
        assert_eq!(limiter.tracked_clients(), 3);
    }

    #[test]
    fn test_zero_quota_is_clamped_to_one() {
        let limiter = UploadRateLimiter::new(&config(0, 0, 0));
        assert!(limiter.check(UploadAction::Upload, "a").is_allowed());
        assert!(!limiter.check(UploadAction::Upload, "a").is_allowed());
    }

    #[test]
    fn test_rate_limit_result() {
        assert!(RateLimitResult::Allowed.is_allowed());
        assert!(!RateLimitResult::Denied {
            retry_after: Duration::from_secs(1)
        }
        .is_allowed());
    }

    async fn gated(limiter: Option<Arc<UploadRateLimiter>>) -> (TempDir, Database, GatedUploads) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).await.unwrap());
        let files = FileService::new(
            db.pool().clone(),
            storage,
            Arc::new(SystemClock),
            UploadLimits::default(),
        );
        let uploads = UploadSessionManager::new(files.clone());
        (temp_dir, db, GatedUploads::new(uploads, files, limiter))
    }

    #[tokio::test]
    async fn test_gate_rejects_before_core() {
        let limiter = Arc::new(UploadRateLimiter::new(&config(1, 1, 1)));
        let (_dir, _db, gate) = gated(Some(limiter)).await;

        let session = gate
            .create_session("client", CreateSession::new("a.bin", 20, 10))
            .await
            .unwrap();
        let err = gate
            .create_session("client", CreateSession::new("b.bin", 20, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, FileHostError::RateLimited { .. }));
        assert!(err.is_retryable());

        gate.accept_chunk("client", &session.session_id, 0, &[0u8; 10])
            .await
            .unwrap();
        assert!(matches!(
            gate.accept_chunk("client", &session.session_id, 1, &[0u8; 10]).await,
            Err(FileHostError::RateLimited { .. })
        ));
        // The rejected chunk never reached the manager
        let status = gate.session_status(&session.session_id).await.unwrap();
        assert_eq!(status.received, vec![0]);

        gate.store_file("client", &mut &b"one"[..], StoreFile::new("one.txt"))
            .await
            .unwrap();
        assert!(matches!(
            gate.store_file("client", &mut &b"two"[..], StoreFile::new("two.txt"))
                .await,
            Err(FileHostError::RateLimited { .. })
        ));
        gate.store_file("other", &mut &b"two"[..], StoreFile::new("two.txt"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_limiter_passes_through() {
        let (_dir, _db, gate) = gated(None).await;
        assert!(gate.limiter().is_none());
        for i in 0..5 {
            gate.store_file("client", &mut format!("file {i}").as_bytes(), StoreFile::new("f.txt"))
                .await
                .unwrap();
        }
    }
}
