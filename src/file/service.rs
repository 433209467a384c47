//! File service for filehost.
//!
//! This module provides high-level file operations including:
//! - Single-shot uploads streamed through the checksum engine
//! - Committing content objects with deduplication
//! - Download, deletion and integrity verification

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::datetime::{add_duration, Clock};
use crate::db::DbPool;
use crate::locks::KeyedLocks;
use crate::upload::UploadSessionRepository;
use crate::{FileHostError, Result};

use super::checksum::{checksum_reader, is_valid_checksum, Checksum};
use super::record::{generate_file_id, FileRecord, FileRecordRepository, NewFileRecord};
use super::storage::{content_key, copy_hashed, ObjectReader, ObjectWriter, StorageBackend};
use super::{resolve_mime_type, validate_filename, Retention, UploadLimits};

/// Attempts at drawing an unused file id before giving up.
const MAX_FILE_ID_ATTEMPTS: usize = 5;

/// Request data for a single-shot upload.
#[derive(Debug, Clone)]
pub struct StoreFile {
    /// Original filename.
    pub original_name: String,
    /// MIME type declared by the client. Guessed from the name when absent.
    pub mime_type: Option<String>,
    /// How long the file is kept.
    pub retention: Retention,
}

impl StoreFile {
    /// Create a new request with default retention.
    pub fn new(original_name: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            mime_type: None,
            retention: Retention::Default,
        }
    }

    /// Set the MIME type.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the retention.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

/// Descriptive fields of a file about to be committed.
#[derive(Debug, Clone)]
pub(crate) struct ContentMeta {
    pub original_name: String,
    pub mime_type: String,
    pub ttl: Option<Duration>,
}

/// File service for storing and serving files.
///
/// Cheap to clone; clones share storage, pool and content locks.
#[derive(Clone)]
pub struct FileService {
    pool: DbPool,
    storage: Arc<dyn StorageBackend>,
    content_locks: KeyedLocks,
    clock: Arc<dyn Clock>,
    limits: UploadLimits,
}

impl FileService {
    /// Create a new FileService.
    pub fn new(
        pool: DbPool,
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            pool,
            storage,
            content_locks: KeyedLocks::new(),
            clock,
            limits,
        }
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Per-object locks guarding commit and deletion of content objects.
    pub fn content_locks(&self) -> &KeyedLocks {
        &self.content_locks
    }

    /// Upload limits.
    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Store a file from a byte stream.
    ///
    /// # Validation
    /// - Filename: non-empty, at most `MAX_FILENAME_LENGTH` characters
    /// - Size: 1 byte up to the configured maximum, enforced while streaming
    ///
    /// # Returns
    /// The created file record. On failure no object or record is left behind.
    pub async fn store_file<R>(&self, reader: &mut R, request: StoreFile) -> Result<FileRecord>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        validate_filename(&request.original_name)?;

        let mut writer = self.storage.create().await?;
        let mut checksum = Checksum::new();
        let copied = match copy_hashed(
            reader,
            writer.as_mut(),
            &mut checksum,
            Some(self.limits.max_file_size),
            FileHostError::Io,
        )
        .await
        {
            Ok(copied) => copied,
            Err(e) => {
                writer.abort().await;
                warn!(name = %request.original_name, error = %e, "Upload aborted");
                return Err(e);
            }
        };

        if copied == 0 {
            writer.abort().await;
            return Err(FileHostError::InvalidArgument(
                "empty files are not accepted".to_string(),
            ));
        }

        let meta = ContentMeta {
            mime_type: resolve_mime_type(&request.original_name, request.mime_type.as_deref()),
            original_name: request.original_name,
            ttl: request.retention.resolve(self.limits.default_file_ttl),
        };
        let record = self
            .commit_content(writer, checksum.finalize(), copied, meta, None)
            .await?;

        info!(
            file_id = %record.file_id,
            size = record.file_size,
            checksum = %record.checksum,
            "Stored file"
        );
        Ok(record)
    }

    /// Commit a fully written object and create its record.
    ///
    /// Runs under the content lock for the object's key. If an identical object
    /// already exists the new bytes are discarded and the record shares it.
    /// When `closes_session` is set the session row is deleted in the same
    /// transaction as the record insert.
    pub(crate) async fn commit_content(
        &self,
        writer: Box<dyn ObjectWriter>,
        checksum: String,
        size: u64,
        meta: ContentMeta,
        closes_session: Option<&str>,
    ) -> Result<FileRecord> {
        let key = content_key(&checksum);
        let _guard = self.content_locks.write(&key).await;

        let created_object = match self.storage.exists(&key).await {
            Ok(true) => {
                writer.abort().await;
                debug!(key = %key, "Content already stored, sharing object");
                false
            }
            Ok(false) => {
                writer.commit(&key).await?;
                true
            }
            Err(e) => {
                writer.abort().await;
                return Err(e);
            }
        };

        let now = self.now();
        let new_record = NewFileRecord {
            file_id: String::new(),
            original_name: meta.original_name,
            mime_type: meta.mime_type,
            file_size: size,
            checksum,
            storage_path: key.clone(),
            expires_at: meta.ttl.map(|ttl| add_duration(now, ttl)),
            created_at: now,
        };

        match self.insert_record(new_record, closes_session).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if created_object {
                    self.release_unreferenced(&key).await;
                }
                Err(e)
            }
        }
    }

    async fn insert_record(
        &self,
        mut new_record: NewFileRecord,
        closes_session: Option<&str>,
    ) -> Result<FileRecord> {
        for _ in 0..MAX_FILE_ID_ATTEMPTS {
            new_record.file_id = generate_file_id();

            let mut tx = self.pool.begin().await?;
            let Some(record) = FileRecordRepository::insert(&mut *tx, &new_record).await? else {
                debug!(file_id = %new_record.file_id, "File id collision, retrying");
                continue;
            };
            if let Some(session_id) = closes_session {
                if !UploadSessionRepository::delete(&mut *tx, session_id).await? {
                    return Err(FileHostError::SessionNotFound(session_id.to_string()));
                }
            }
            tx.commit().await?;
            return Ok(record);
        }
        Err(FileHostError::Metadata(
            "could not allocate a unique file id".to_string(),
        ))
    }

    /// Delete `key` if no record references it. Caller holds the content lock.
    async fn release_unreferenced(&self, key: &str) {
        let repo = FileRecordRepository::new(&self.pool);
        match repo.count_by_storage_path(key).await {
            Ok(0) => {
                if let Err(e) = self.storage.delete(key).await {
                    error!(key, error = %e, "Failed to remove unreferenced object");
                }
            }
            Ok(_) => {}
            Err(e) => {
                // Leave the object; the optimizer reaps it if it stays orphaned.
                warn!(key, error = %e, "Could not check object references");
            }
        }
    }

    /// Get a live file record.
    ///
    /// # Returns
    /// `NotFound` if the file does not exist or has expired, even before a sweep removes it.
    pub async fn get_file(&self, file_id: &str) -> Result<FileRecord> {
        let record = FileRecordRepository::new(&self.pool)
            .get_by_file_id(file_id)
            .await?
            .ok_or_else(|| FileHostError::NotFound(format!("file {file_id}")))?;
        if record.is_expired(self.now()) {
            return Err(FileHostError::NotFound(format!("file {file_id}")));
        }
        Ok(record)
    }

    /// Open a live file for streaming.
    pub async fn open_file(&self, file_id: &str) -> Result<(FileRecord, ObjectReader)> {
        let record = self.get_file(file_id).await?;
        match self.storage.open(&record.storage_path).await {
            Ok(reader) => Ok((record, reader)),
            Err(FileHostError::NotFound(_)) => {
                error!(file_id, key = %record.storage_path, "Content object missing");
                Err(FileHostError::StorageRead(format!(
                    "content for file {file_id} is missing"
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Read a live file fully into memory.
    pub async fn read_file(&self, file_id: &str) -> Result<(FileRecord, Vec<u8>)> {
        let (record, mut reader) = self.open_file(file_id).await?;
        let mut content = Vec::with_capacity(record.file_size as usize);
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| FileHostError::StorageRead(format!("file {file_id}: {e}")))?;
        Ok((record, content))
    }

    /// Delete a file, expired or not.
    ///
    /// # Returns
    /// `false` if the file did not exist.
    pub async fn delete_file(&self, file_id: &str) -> Result<bool> {
        let Some(record) = FileRecordRepository::new(&self.pool)
            .get_by_file_id(file_id)
            .await?
        else {
            return Ok(false);
        };
        let removed = self.remove_record(&record).await?;
        if removed {
            info!(file_id, "Deleted file");
        }
        Ok(removed)
    }

    /// Remove a record and, if nothing else shares it, its content object.
    ///
    /// Storage goes first. If the storage delete fails the record is kept so a
    /// later pass can retry. A missing object counts as already deleted.
    pub(crate) async fn remove_record(&self, record: &FileRecord) -> Result<bool> {
        let _guard = self.content_locks.write(&record.storage_path).await;
        let repo = FileRecordRepository::new(&self.pool);

        let others = repo
            .count_other_references(&record.storage_path, &record.file_id)
            .await?;
        if others == 0 {
            let existed = self.storage.delete(&record.storage_path).await?;
            if !existed {
                debug!(file_id = %record.file_id, key = %record.storage_path, "Content object already gone");
            }
        }
        repo.delete_by_file_id(&record.file_id).await
    }

    /// Delete a content object no record references.
    ///
    /// Rechecks references under the content lock. Returns `false` if the
    /// object is referenced after all or was already gone.
    pub(crate) async fn remove_orphan_object(&self, key: &str) -> Result<bool> {
        let _guard = self.content_locks.write(key).await;
        if FileRecordRepository::new(&self.pool)
            .count_by_storage_path(key)
            .await?
            > 0
        {
            return Ok(false);
        }
        self.storage.delete(key).await
    }

    /// Recompute a live file's checksum from storage and compare.
    pub async fn verify_file(&self, file_id: &str) -> Result<bool> {
        let record = self.get_file(file_id).await?;
        self.verify_record(&record).await
    }

    /// Recompute a record's checksum from storage and compare.
    ///
    /// A missing object or a malformed stored checksum fails verification.
    pub async fn verify_record(&self, record: &FileRecord) -> Result<bool> {
        if !is_valid_checksum(&record.checksum) {
            warn!(file_id = %record.file_id, "Stored checksum is malformed");
            return Ok(false);
        }
        let mut reader = match self.storage.open(&record.storage_path).await {
            Ok(reader) => reader,
            Err(FileHostError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let (checksum, size) = checksum_reader(&mut reader)
            .await
            .map_err(|e| FileHostError::StorageRead(format!("{}: {e}", record.storage_path)))?;
        Ok(checksum == record.checksum && size == record.file_size)
    }
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("storage", &self.storage.name())
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datetime::ManualClock;
    use crate::file::checksum_hex;
    use crate::file::storage::LocalStorage;
    use crate::Database;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        _db: Database,
        clock: Arc<ManualClock>,
        service: FileService,
    }

    async fn setup() -> Fixture {
        setup_with_limits(UploadLimits::default()).await
    }

    async fn setup_with_limits(limits: UploadLimits) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        let service = FileService::new(db.pool().clone(), storage, clock.clone(), limits);
        Fixture {
            _temp_dir: temp_dir,
            _db: db,
            clock,
            service,
        }
    }

    #[tokio::test]
    async fn test_store_and_read() {
        let fx = setup().await;
        let data = b"Hello, filehost!".to_vec();

        let record = fx
            .service
            .store_file(&mut &data[..], StoreFile::new("hello.txt"))
            .await
            .unwrap();

        assert_eq!(record.file_id.len(), crate::file::FILE_ID_LEN);
        assert_eq!(record.file_size, data.len() as u64);
        assert_eq!(record.checksum, checksum_hex(&data));
        assert_eq!(record.mime_type, "text/plain");
        assert_eq!(record.storage_path, content_key(&record.checksum));
        // Default retention is seven days
        assert_eq!(
            record.expires_at,
            Some(fx.clock.now() + chrono::Duration::days(7))
        );

        let (fetched, content) = fx.service.read_file(&record.file_id).await.unwrap();
        assert_eq!(fetched, record);
        assert_eq!(content, data);
        assert!(fx.service.verify_file(&record.file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_rejects_empty_input() {
        let fx = setup().await;

        let result = fx
            .service
            .store_file(&mut &b""[..], StoreFile::new("empty.txt"))
            .await;

        assert!(matches!(result, Err(FileHostError::InvalidArgument(_))));
        assert!(fx.service.storage().list_temp().await.unwrap().is_empty());
        assert!(fx.service.storage().list_objects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_rejects_bad_name() {
        let fx = setup().await;

        let result = fx.service.store_file(&mut &b"x"[..], StoreFile::new("")).await;
        assert!(matches!(result, Err(FileHostError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_store_enforces_max_size() {
        let fx = setup_with_limits(UploadLimits {
            max_file_size: 10,
            ..UploadLimits::default()
        })
        .await;

        let result = fx
            .service
            .store_file(&mut &[0u8; 11][..], StoreFile::new("big.bin"))
            .await;
        assert!(matches!(result, Err(FileHostError::InvalidArgument(_))));
        assert!(fx.service.storage().list_temp().await.unwrap().is_empty());

        let ok = fx
            .service
            .store_file(&mut &[0u8; 10][..], StoreFile::new("fits.bin"))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let fx = setup().await;

        let a = fx
            .service
            .store_file(&mut &b"same bytes"[..], StoreFile::new("a.bin"))
            .await
            .unwrap();
        let b = fx
            .service
            .store_file(&mut &b"same bytes"[..], StoreFile::new("b.bin"))
            .await
            .unwrap();

        assert_ne!(a.file_id, b.file_id);
        assert_eq!(a.storage_path, b.storage_path);
        assert_eq!(fx.service.storage().list_objects().await.unwrap().len(), 1);

        // Deleting one keeps the shared object for the other
        assert!(fx.service.delete_file(&a.file_id).await.unwrap());
        assert!(fx.service.storage().exists(&b.storage_path).await.unwrap());
        assert_eq!(fx.service.read_file(&b.file_id).await.unwrap().1, b"same bytes");

        assert!(fx.service.delete_file(&b.file_id).await.unwrap());
        assert!(!fx.service.storage().exists(&b.storage_path).await.unwrap());
        assert!(!fx.service.delete_file(&b.file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_file_is_not_found() {
        let fx = setup().await;
        let record = fx
            .service
            .store_file(
                &mut &b"short lived"[..],
                StoreFile::new("tmp.txt").with_retention(Retention::For(Duration::from_secs(60))),
            )
            .await
            .unwrap();

        assert!(fx.service.get_file(&record.file_id).await.is_ok());

        fx.clock.advance(Duration::from_secs(60));
        assert!(matches!(
            fx.service.get_file(&record.file_id).await,
            Err(FileHostError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.open_file(&record.file_id).await,
            Err(FileHostError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retention_never() {
        let fx = setup().await;
        let record = fx
            .service
            .store_file(
                &mut &b"keep"[..],
                StoreFile::new("keep.txt")
                    .with_mime_type("application/x-custom")
                    .with_retention(Retention::Never),
            )
            .await
            .unwrap();

        assert_eq!(record.expires_at, None);
        assert_eq!(record.mime_type, "application/x-custom");
    }

    #[tokio::test]
    async fn test_missing_object_is_storage_read_error() {
        let fx = setup().await;
        let record = fx
            .service
            .store_file(&mut &b"will vanish"[..], StoreFile::new("v.txt"))
            .await
            .unwrap();
        fx.service.storage().delete(&record.storage_path).await.unwrap();

        assert!(matches!(
            fx.service.open_file(&record.file_id).await,
            Err(FileHostError::StorageRead(_))
        ));
        assert!(!fx.service.verify_file(&record.file_id).await.unwrap());

        // Deleting still succeeds with the object already gone
        assert!(fx.service.delete_file(&record.file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let fx = setup().await;
        let record = fx
            .service
            .store_file(&mut &b"original"[..], StoreFile::new("o.txt"))
            .await
            .unwrap();

        fx.service
            .storage()
            .put(&record.storage_path, b"tampered")
            .await
            .unwrap();

        assert!(!fx.service.verify_file(&record.file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_stored_checksum() {
        let fx = setup().await;
        let record = fx
            .service
            .store_file(&mut &b"intact"[..], StoreFile::new("i.txt"))
            .await
            .unwrap();

        sqlx::query("UPDATE files SET checksum = $1 WHERE file_id = $2")
            .bind(record.checksum.to_uppercase())
            .bind(&record.file_id)
            .execute(fx.service.pool())
            .await
            .unwrap();

        assert!(!fx.service.verify_file(&record.file_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_orphan_object_respects_references() {
        let fx = setup().await;
        let record = fx
            .service
            .store_file(&mut &b"referenced"[..], StoreFile::new("r.txt"))
            .await
            .unwrap();
        let orphan = content_key(&checksum_hex(b"orphan"));
        fx.service.storage().put(&orphan, b"orphan").await.unwrap();

        assert!(!fx.service.remove_orphan_object(&record.storage_path).await.unwrap());
        assert!(fx.service.remove_orphan_object(&orphan).await.unwrap());
        assert!(!fx.service.remove_orphan_object(&orphan).await.unwrap());
    }
}
