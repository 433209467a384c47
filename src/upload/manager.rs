//! Upload session manager.
//!
//! Sole owner of upload session state transitions. Each session is guarded by
//! a per-session `RwLock`: chunk writes share the read side so different
//! indices land concurrently, while finalize, cancel and expiry discard take
//! the write side.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datetime::add_duration;
use crate::file::service::ContentMeta;
use crate::file::storage::copy_hashed;
use crate::file::{
    resolve_mime_type, validate_filename, Checksum, FileRecord, FileService, Retention,
    StorageBackend,
};
use crate::locks::KeyedLocks;
use crate::{FileHostError, Result};

use super::session::{expected_chunk_count, UploadSession, UploadSessionRepository};

/// Request data for opening an upload session.
#[derive(Debug, Clone)]
pub struct CreateSession {
    /// Filename the assembled file will carry.
    pub original_name: String,
    /// Declared total size in bytes.
    pub total_size: u64,
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Session lifetime. Defaults to the configured session TTL.
    pub ttl: Option<Duration>,
    /// MIME type of the file, if the client knows it.
    pub mime_type: Option<String>,
    /// Retention of the resulting file.
    pub retention: Retention,
}

impl CreateSession {
    /// Create a new request.
    pub fn new(original_name: impl Into<String>, total_size: u64, chunk_size: u64) -> Self {
        Self {
            original_name: original_name.into(),
            total_size,
            chunk_size,
            ttl: None,
            mime_type: None,
            retention: Retention::Default,
        }
    }

    /// Set the session lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the retention of the resulting file.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

/// Outcome of a chunk upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkAccepted {
    /// Index of the chunk.
    pub index: u64,
    /// Always `true`; rejected chunks are reported as errors.
    pub accepted: bool,
    /// The index had been received before. The bytes were replaced.
    pub duplicate: bool,
    /// Chunks still missing after this one.
    pub remaining: u64,
}

/// Progress of an upload session, for resuming clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// The session.
    pub session: UploadSession,
    /// Received indices, ascending.
    pub received: Vec<u64>,
    /// Missing indices, ascending.
    pub missing: Vec<u64>,
    /// Bytes received so far.
    pub bytes_received: u64,
    /// Whether every chunk has arrived.
    pub complete: bool,
}

/// Manager for chunked upload sessions.
#[derive(Clone)]
pub struct UploadSessionManager {
    files: FileService,
    locks: KeyedLocks,
}

impl UploadSessionManager {
    /// Create a manager that commits assembled files through `files`.
    pub fn new(files: FileService) -> Self {
        Self {
            files,
            locks: KeyedLocks::new(),
        }
    }

    /// Per-session lock registry.
    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    fn storage(&self) -> &Arc<dyn StorageBackend> {
        self.files.storage()
    }

    fn repo(&self) -> UploadSessionRepository<'_> {
        UploadSessionRepository::new(self.files.pool())
    }

    /// Open a new upload session.
    ///
    /// # Validation
    /// - Sizes: both positive, within the configured maxima
    /// - Chunk count: at most the configured maximum
    /// - Filename: non-empty, at most `MAX_FILENAME_LENGTH` characters
    pub async fn create_session(&self, request: CreateSession) -> Result<UploadSession> {
        let limits = self.files.limits();
        validate_filename(&request.original_name)?;
        if request.total_size == 0 {
            return Err(FileHostError::InvalidArgument(
                "total_size must be positive".to_string(),
            ));
        }
        if request.chunk_size == 0 {
            return Err(FileHostError::InvalidArgument(
                "chunk_size must be positive".to_string(),
            ));
        }
        if request.total_size > limits.max_file_size {
            return Err(FileHostError::InvalidArgument(format!(
                "total_size exceeds the maximum of {} bytes",
                limits.max_file_size
            )));
        }
        if request.chunk_size > limits.max_chunk_size {
            return Err(FileHostError::InvalidArgument(format!(
                "chunk_size exceeds the maximum of {} bytes",
                limits.max_chunk_size
            )));
        }
        let chunks = expected_chunk_count(request.total_size, request.chunk_size);
        if chunks > limits.max_chunk_count {
            return Err(FileHostError::InvalidArgument(format!(
                "upload needs {chunks} chunks, the maximum is {}",
                limits.max_chunk_count
            )));
        }

        let now = self.files.now();
        let ttl = request.ttl.unwrap_or(limits.session_ttl);
        let session = UploadSession {
            session_id: Uuid::new_v4().to_string(),
            original_name: request.original_name,
            mime_type: request.mime_type.filter(|m| !m.trim().is_empty()),
            total_size: request.total_size,
            chunk_size: request.chunk_size,
            file_ttl_secs: request
                .retention
                .resolve(limits.default_file_ttl)
                .map(|ttl| ttl.as_secs()),
            expires_at: add_duration(now, ttl),
            created_at: now,
        };
        self.repo().create(&session).await?;

        info!(
            session_id = %session.session_id,
            total_size = session.total_size,
            chunk_size = session.chunk_size,
            chunks,
            "Upload session created"
        );
        Ok(session)
    }

    /// Get a live session.
    pub async fn get_session(&self, session_id: &str) -> Result<UploadSession> {
        let session = self
            .repo()
            .get(session_id)
            .await?
            .ok_or_else(|| FileHostError::SessionNotFound(session_id.to_string()))?;
        if session.is_expired(self.files.now()) {
            self.expire(session_id).await;
            return Err(FileHostError::SessionExpired(session_id.to_string()));
        }
        Ok(session)
    }

    /// Accept one chunk.
    ///
    /// The chunk object is written before its index is recorded, so a recorded
    /// index always has bytes behind it. Re-sending an index replaces the bytes
    /// and reports `duplicate`.
    pub async fn accept_chunk(
        &self,
        session_id: &str,
        index: u64,
        bytes: &[u8],
    ) -> Result<ChunkAccepted> {
        let guard = self.locks.read(session_id).await;

        let Some(session) = self.repo().get(session_id).await? else {
            return Err(FileHostError::SessionNotFound(session_id.to_string()));
        };
        let now = self.files.now();
        if session.is_expired(now) {
            drop(guard);
            self.expire(session_id).await;
            return Err(FileHostError::SessionExpired(session_id.to_string()));
        }

        let expected_chunks = session.expected_chunk_count();
        let expected_len =
            session
                .expected_chunk_len(index)
                .ok_or(FileHostError::InvalidChunkIndex {
                    index,
                    expected: expected_chunks,
                })?;
        if bytes.len() as u64 != expected_len {
            return Err(FileHostError::ChunkSizeMismatch {
                index,
                expected: expected_len,
                actual: bytes.len() as u64,
            });
        }

        self.storage().put_chunk(session_id, index, bytes).await?;
        let inserted = self.repo().add_chunk(session_id, index, now).await?;
        let received = self.repo().count_chunks(session_id).await?;
        drop(guard);

        debug!(session_id, index, duplicate = !inserted, received, "Chunk accepted");
        Ok(ChunkAccepted {
            index,
            accepted: true,
            duplicate: !inserted,
            remaining: expected_chunks.saturating_sub(received),
        })
    }

    /// Assemble the file if every chunk has arrived.
    ///
    /// # Returns
    /// `None` while chunks are missing. Otherwise the new file record; the
    /// session and its chunks are gone afterwards. On failure the session is
    /// left intact and the call can be retried.
    pub async fn finalize_if_complete(&self, session_id: &str) -> Result<Option<FileRecord>> {
        let _guard = self.locks.write(session_id).await;

        let Some(session) = self.repo().get(session_id).await? else {
            return Err(FileHostError::SessionNotFound(session_id.to_string()));
        };
        if session.is_expired(self.files.now()) {
            self.discard_locked(session_id).await?;
            return Err(FileHostError::SessionExpired(session_id.to_string()));
        }

        let received = self.repo().received_chunks(session_id).await?;
        if !session.is_complete(&received) {
            debug!(
                session_id,
                received = received.len(),
                expected = session.expected_chunk_count(),
                "Session not complete yet"
            );
            return Ok(None);
        }

        let (writer, checksum) = self.assemble(&session).await?;
        let meta = ContentMeta {
            mime_type: resolve_mime_type(&session.original_name, session.mime_type.as_deref()),
            original_name: session.original_name.clone(),
            ttl: session.file_ttl(),
        };
        let record = self
            .files
            .commit_content(writer, checksum.finalize(), session.total_size, meta, Some(session_id))
            .await?;

        if let Err(e) = self.storage().delete_chunks(session_id).await {
            warn!(session_id, error = %e, "Failed to delete chunks after assembly");
        }

        info!(
            session_id,
            file_id = %record.file_id,
            size = record.file_size,
            "Upload session finalized"
        );
        Ok(Some(record))
    }

    /// Stream every chunk in index order into one storage writer.
    async fn assemble(
        &self,
        session: &UploadSession,
    ) -> Result<(Box<dyn crate::file::ObjectWriter>, Checksum)> {
        let mut writer = self.storage().create().await?;
        let mut checksum = Checksum::new();

        for index in 0..session.expected_chunk_count() {
            let step = async {
                let mut reader = match self.storage().open_chunk(&session.session_id, index).await {
                    Ok(reader) => reader,
                    Err(FileHostError::NotFound(what)) => {
                        return Err(FileHostError::StorageRead(format!("{what} is missing")));
                    }
                    Err(e) => return Err(e),
                };
                copy_hashed(
                    &mut reader,
                    writer.as_mut(),
                    &mut checksum,
                    None,
                    |e| FileHostError::StorageRead(e.to_string()),
                )
                .await
            }
            .await;

            if let Err(e) = step {
                writer.abort().await;
                warn!(session_id = %session.session_id, index, error = %e, "Assembly failed");
                return Err(e);
            }
        }

        if checksum.bytes_hashed() != session.total_size {
            let assembled = checksum.bytes_hashed();
            writer.abort().await;
            return Err(FileHostError::StorageRead(format!(
                "assembled {assembled} bytes, expected {}",
                session.total_size
            )));
        }
        Ok((writer, checksum))
    }

    /// Cancel a session and drop its chunks.
    ///
    /// # Returns
    /// `false` if the session did not exist.
    pub async fn cancel_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.locks.write(session_id).await;
        if self.repo().get(session_id).await?.is_none() {
            return Ok(false);
        }
        self.discard_locked(session_id).await?;
        info!(session_id, "Upload session cancelled");
        Ok(true)
    }

    /// Progress report for a live session.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let session = self.get_session(session_id).await?;
        let received = self.repo().received_chunks(session_id).await?;
        Ok(SessionStatus {
            missing: session.missing_chunks(&received),
            bytes_received: session.bytes_received(&received),
            complete: session.is_complete(&received),
            received,
            session,
        })
    }

    /// Delete a session if it is expired at `now`.
    ///
    /// Rechecks under the session's write lock, so a session that was
    /// finalized or extended in the meantime is left alone.
    pub async fn purge_expired(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.locks.write(session_id).await;
        match self.repo().get(session_id).await? {
            Some(session) if session.expires_at <= now => {
                self.discard_locked(session_id).await?;
                info!(session_id, "Expired upload session removed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete chunk data that has no session.
    ///
    /// Returns `false` if a session with this id exists.
    pub async fn remove_orphan_chunks(&self, session_id: &str) -> Result<bool> {
        let _guard = self.locks.write(session_id).await;
        if self.repo().get(session_id).await?.is_some() {
            return Ok(false);
        }
        self.storage().delete_chunks(session_id).await?;
        Ok(true)
    }

    /// Lazily discard a session found expired on a request path.
    async fn expire(&self, session_id: &str) {
        let now = self.files.now();
        match self.purge_expired(session_id, now).await {
            Ok(_) => {}
            Err(e) => warn!(session_id, error = %e, "Failed to discard expired session"),
        }
    }

    /// Chunks first, then the row. Caller holds the write lock.
    async fn discard_locked(&self, session_id: &str) -> Result<()> {
        self.storage().delete_chunks(session_id).await?;
        UploadSessionRepository::delete(self.files.pool(), session_id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for UploadSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessionManager")
            .field("locks", &self.locks)
            .finish()
    }
}
