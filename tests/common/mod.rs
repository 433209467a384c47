//! Test helpers for integration tests.
//!
//! Provides TestHost, a fully wired file host over a temp directory, and
//! FailingStorage for injecting storage faults.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use filehost::file::{ObjectReader, StoredObject};
use filehost::{
    Config, Database, FileHost, FileHostError, LocalStorage, ManualClock, ObjectWriter, Result,
    StorageBackend,
};

/// Fixed start time for the manual clock.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// A file host over a temp directory with a file-backed database and a manual clock.
pub struct TestHost {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub storage: Arc<FailingStorage>,
    pub host: FileHost,
}

impl TestHost {
    /// Host with default configuration and rate limiting off.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Host with configuration adjusted by `configure`.
    pub async fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("filehost.db").display().to_string();
        config.storage.path = dir.path().join("storage").display().to_string();
        config.rate_limit.enabled = false;
        configure(&mut config);

        let db = Database::open(&config.database.path).await.unwrap();
        let storage = Arc::new(FailingStorage::new(&config.storage.path).await);
        let clock = Arc::new(ManualClock::new(start_time()));
        let host = FileHost::with_parts(config, db, storage.clone(), clock.clone());

        Self {
            dir,
            clock,
            storage,
            host,
        }
    }

    /// Storage root on disk.
    pub fn storage_root(&self) -> PathBuf {
        self.dir.path().join("storage")
    }
}

/// `LocalStorage` with switchable faults.
pub struct FailingStorage {
    inner: LocalStorage,
    fail_writes: AtomicBool,
    fail_object_deletes: AtomicBool,
}

impl FailingStorage {
    pub async fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalStorage::new(path).await.unwrap(),
            fail_writes: AtomicBool::new(false),
            fail_object_deletes: AtomicBool::new(false),
        }
    }

    /// Make object writers fail on every write.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make deletes of content objects fail.
    pub fn fail_object_deletes(&self, fail: bool) {
        self.fail_object_deletes.store(fail, Ordering::SeqCst);
    }
}

struct FailingWriter {
    inner: Box<dyn ObjectWriter>,
}

#[async_trait]
impl ObjectWriter for FailingWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        // Let the bytes reach the temp file first, so cleanup is exercised.
        self.inner.write(buf).await?;
        Err(FileHostError::StorageWrite("injected write failure".to_string()))
    }

    fn written(&self) -> u64 {
        self.inner.written()
    }

    async fn commit(self: Box<Self>, key: &str) -> Result<u64> {
        self.inner.commit(key).await
    }

    async fn abort(self: Box<Self>) {
        self.inner.abort().await
    }
}

#[async_trait]
impl StorageBackend for FailingStorage {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn root(&self) -> Option<&Path> {
        self.inner.root()
    }

    async fn create(&self) -> Result<Box<dyn ObjectWriter>> {
        let writer = self.inner.create().await?;
        if self.fail_writes.load(Ordering::SeqCst) {
            Ok(Box::new(FailingWriter { inner: writer }))
        } else {
            Ok(writer)
        }
    }

    async fn open(&self, key: &str) -> Result<ObjectReader> {
        self.inner.open(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn size(&self, key: &str) -> Result<u64> {
        self.inner.size(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if key.starts_with("objects/") && self.fail_object_deletes.load(Ordering::SeqCst) {
            return Err(FileHostError::StorageWrite(format!(
                "injected delete failure for {key}"
            )));
        }
        self.inner.delete(key).await
    }

    async fn put_chunk(&self, session_id: &str, index: u64, data: &[u8]) -> Result<()> {
        self.inner.put_chunk(session_id, index, data).await
    }

    async fn open_chunk(&self, session_id: &str, index: u64) -> Result<ObjectReader> {
        self.inner.open_chunk(session_id, index).await
    }

    async fn delete_chunks(&self, session_id: &str) -> Result<usize> {
        self.inner.delete_chunks(session_id).await
    }

    async fn list_objects(&self) -> Result<Vec<StoredObject>> {
        self.inner.list_objects().await
    }

    async fn list_chunk_sessions(&self) -> Result<Vec<StoredObject>> {
        self.inner.list_chunk_sessions().await
    }

    async fn list_temp(&self) -> Result<Vec<StoredObject>> {
        self.inner.list_temp().await
    }

    async fn remove_empty_dirs(&self) -> Result<usize> {
        self.inner.remove_empty_dirs().await
    }
}
