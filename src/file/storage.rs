//! Content storage for filehost.
//!
//! [`StorageBackend`] is the seam between the services and the bytes. Objects
//! are written through an [`ObjectWriter`] into a temporary location and only
//! become visible under their key on `commit`, so a failed or abandoned write
//! never leaves a partial object behind.
//!
//! [`LocalStorage`] lays data out like this:
//! ```text
//! {base_path}/
//! ├── objects/
//! │   └── ba/
//! │       └── ba7816bf...15ad          (content-addressed by SHA-256)
//! ├── chunks/
//! │   └── {session_id}/
//! │       ├── 00000000.chunk
//! │       └── 00000001.chunk
//! └── tmp/
//!     └── {uuid}.part                  (in-flight writes)
//! ```

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use super::checksum::{Checksum, READ_BUFFER_SIZE};
use crate::datetime::from_system_time;
use crate::{FileHostError, Result};

const OBJECTS_DIR: &str = "objects";
const CHUNKS_DIR: &str = "chunks";
const TMP_DIR: &str = "tmp";

/// Boxed reader over a stored object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage key for content with the given checksum.
pub fn content_key(checksum: &str) -> String {
    let shard = checksum.get(..2).unwrap_or(checksum);
    format!("{OBJECTS_DIR}/{shard}/{checksum}")
}

/// An entry found while scanning storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object key, chunk-set session id, or temp key depending on the listing.
    pub key: String,
    /// Total size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// In-flight object write.
///
/// Dropping a writer without calling `commit` or `abort` discards the data.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append bytes.
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Bytes written so far.
    fn written(&self) -> u64;

    /// Make the data visible under `key`, replacing any existing object.
    ///
    /// Returns the committed size. On failure nothing is left behind.
    async fn commit(self: Box<Self>, key: &str) -> Result<u64>;

    /// Discard everything written.
    async fn abort(self: Box<Self>);
}

/// Storage backend abstraction.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Local root directory, if the backend lives on a filesystem.
    fn root(&self) -> Option<&Path> {
        None
    }

    /// Start writing a new object.
    async fn create(&self) -> Result<Box<dyn ObjectWriter>>;

    /// Open an object for streaming reads.
    ///
    /// Fails with `NotFound` if the key does not exist.
    async fn open(&self, key: &str) -> Result<ObjectReader>;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Size of an object in bytes.
    async fn size(&self, key: &str) -> Result<u64>;

    /// Delete an object. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Durably store one chunk of an upload session, replacing any previous copy.
    async fn put_chunk(&self, session_id: &str, index: u64, data: &[u8]) -> Result<()>;

    /// Open a stored chunk.
    async fn open_chunk(&self, session_id: &str, index: u64) -> Result<ObjectReader>;

    /// Delete every chunk of a session. Returns the number of chunks removed.
    async fn delete_chunks(&self, session_id: &str) -> Result<usize>;

    /// All content objects.
    async fn list_objects(&self) -> Result<Vec<StoredObject>>;

    /// One entry per session that has chunk data, keyed by session id.
    async fn list_chunk_sessions(&self) -> Result<Vec<StoredObject>>;

    /// Leftover temporary files from interrupted writes.
    async fn list_temp(&self) -> Result<Vec<StoredObject>>;

    /// Remove empty shard and chunk directories. Returns how many were removed.
    async fn remove_empty_dirs(&self) -> Result<usize>;

    /// Write a whole object in one call.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let mut writer = self.create().await?;
        if let Err(e) = writer.write(data).await {
            writer.abort().await;
            return Err(e);
        }
        writer.commit(key).await
    }

    /// Read a whole object into memory.
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.open(key).await?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| FileHostError::StorageRead(format!("{key}: {e}")))?;
        Ok(data)
    }
}

/// Stream `reader` into `writer`, hashing as it goes.
///
/// Stops with `InvalidArgument` once more than `limit` bytes arrive. Read
/// failures are classified by `read_err`. The writer is left open either way;
/// the caller decides whether to commit or abort.
pub async fn copy_hashed<R>(
    reader: &mut R,
    writer: &mut dyn ObjectWriter,
    checksum: &mut Checksum,
    limit: Option<u64>,
    read_err: fn(io::Error) -> FileHostError,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(read_err)?;
        if n == 0 {
            return Ok(copied);
        }
        copied += n as u64;
        if let Some(limit) = limit {
            if copied > limit {
                return Err(FileHostError::InvalidArgument(format!(
                    "content exceeds the maximum size of {limit} bytes"
                )));
            }
        }
        checksum.update(&buf[..n]);
        writer.write(&buf[..n]).await?;
    }
}

fn write_err(context: &str, path: &Path, e: io::Error) -> FileHostError {
    FileHostError::StorageWrite(format!("{context} {}: {e}", path.display()))
}

fn read_err(context: &str, path: &Path, e: io::Error) -> FileHostError {
    FileHostError::StorageRead(format!("{context} {}: {e}", path.display()))
}

/// Resolve a storage key under `base`, rejecting keys that could escape it.
fn resolve_key(base: &Path, key: &str) -> Result<PathBuf> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if !valid {
        return Err(FileHostError::InvalidArgument(format!(
            "invalid storage key: {key:?}"
        )));
    }
    Ok(base.join(key))
}

fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(FileHostError::InvalidArgument(format!(
            "invalid session id: {session_id:?}"
        )));
    }
    Ok(())
}

/// Rename `from` to `to`, creating the destination directory.
///
/// Retries once if the directory vanished in between (empty-directory
/// cleanup can race with a commit).
async fn rename_into(from: &Path, to: &Path) -> io::Result<()> {
    for attempt in 0..2 {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::rename(from, to).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt == 0 && from.exists() => {
                continue;
            }
            other => return other,
        }
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn modified_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(from_system_time)
        .unwrap_or_else(|_| Utc::now())
}

/// Files directly inside `dir`. A missing directory lists as empty.
async fn list_files(dir: &Path) -> io::Result<Vec<(String, std::fs::Metadata)>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            // Removed while scanning
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if meta.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                files.push((name.to_string(), meta));
            }
        }
    }
    Ok(files)
}

/// Subdirectories directly inside `dir`.
async fn list_dirs(dir: &Path) -> io::Result<Vec<(String, PathBuf, std::fs::Metadata)>> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                dirs.push((name.to_string(), entry.path(), meta));
            }
        }
    }
    Ok(dirs)
}

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Open storage rooted at `base_path`, creating the directory layout.
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        for dir in [OBJECTS_DIR, CHUNKS_DIR, TMP_DIR] {
            let path = base_path.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| write_err("create", &path, e))?;
        }
        Ok(Self { base_path })
    }

    /// Root directory of this storage.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        resolve_key(&self.base_path, key)
    }

    fn chunk_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.base_path.join(CHUNKS_DIR).join(session_id))
    }

    fn chunk_path(&self, session_id: &str, index: u64) -> Result<PathBuf> {
        Ok(self.chunk_dir(session_id)?.join(format!("{index:08}.chunk")))
    }

    fn temp_path(&self) -> PathBuf {
        self.base_path
            .join(TMP_DIR)
            .join(format!("{}.part", Uuid::new_v4()))
    }

    async fn open_path(path: &Path, key: &str) -> Result<ObjectReader> {
        match fs::File::open(path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileHostError::NotFound(format!("object {key}")))
            }
            Err(e) => Err(read_err("open", path, e)),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.base_path)
    }

    async fn create(&self) -> Result<Box<dyn ObjectWriter>> {
        let temp_path = self.temp_path();
        let file = fs::File::create(&temp_path)
            .await
            .map_err(|e| write_err("create", &temp_path, e))?;
        Ok(Box::new(LocalObjectWriter {
            file: Some(BufWriter::new(file)),
            temp_path,
            base_path: self.base_path.clone(),
            written: 0,
        }))
    }

    async fn open(&self, key: &str) -> Result<ObjectReader> {
        let path = self.key_to_path(key)?;
        Self::open_path(&path, key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| read_err("stat", &path, e))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.key_to_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileHostError::NotFound(format!("object {key}")))
            }
            Err(e) => Err(read_err("stat", &path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key)?;
        let removed = remove_if_exists(&path)
            .await
            .map_err(|e| write_err("delete", &path, e))?;
        if removed {
            debug!(key, "Deleted object");
        }
        Ok(removed)
    }

    async fn put_chunk(&self, session_id: &str, index: u64, data: &[u8]) -> Result<()> {
        let final_path = self.chunk_path(session_id, index)?;
        let temp_path = self.temp_path();

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            rename_into(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = remove_if_exists(&temp_path).await;
            return Err(write_err("store chunk", &final_path, e));
        }
        Ok(())
    }

    async fn open_chunk(&self, session_id: &str, index: u64) -> Result<ObjectReader> {
        let path = self.chunk_path(session_id, index)?;
        Self::open_path(&path, &format!("chunk {session_id}/{index}")).await
    }

    async fn delete_chunks(&self, session_id: &str) -> Result<usize> {
        let dir = self.chunk_dir(session_id)?;
        let count = list_files(&dir)
            .await
            .map_err(|e| write_err("scan", &dir, e))?
            .len();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(write_err("delete", &dir, e)),
        }
    }

    async fn list_objects(&self) -> Result<Vec<StoredObject>> {
        let root = self.base_path.join(OBJECTS_DIR);
        let shards = list_dirs(&root)
            .await
            .map_err(|e| read_err("scan", &root, e))?;

        let mut objects = Vec::new();
        for (shard, shard_path, _) in shards {
            let files = list_files(&shard_path)
                .await
                .map_err(|e| read_err("scan", &shard_path, e))?;
            objects.extend(files.into_iter().map(|(name, meta)| StoredObject {
                key: format!("{OBJECTS_DIR}/{shard}/{name}"),
                size: meta.len(),
                modified: modified_of(&meta),
            }));
        }
        Ok(objects)
    }

    async fn list_chunk_sessions(&self) -> Result<Vec<StoredObject>> {
        let root = self.base_path.join(CHUNKS_DIR);
        let dirs = list_dirs(&root)
            .await
            .map_err(|e| read_err("scan", &root, e))?;

        let mut sets = Vec::with_capacity(dirs.len());
        for (session_id, path, dir_meta) in dirs {
            let files = list_files(&path)
                .await
                .map_err(|e| read_err("scan", &path, e))?;
            let modified = files
                .iter()
                .map(|(_, meta)| modified_of(meta))
                .chain(std::iter::once(modified_of(&dir_meta)))
                .max()
                .unwrap_or_else(Utc::now);
            sets.push(StoredObject {
                key: session_id,
                size: files.iter().map(|(_, meta)| meta.len()).sum(),
                modified,
            });
        }
        Ok(sets)
    }

    async fn list_temp(&self) -> Result<Vec<StoredObject>> {
        let root = self.base_path.join(TMP_DIR);
        let files = list_files(&root)
            .await
            .map_err(|e| read_err("scan", &root, e))?;
        Ok(files
            .into_iter()
            .map(|(name, meta)| StoredObject {
                key: format!("{TMP_DIR}/{name}"),
                size: meta.len(),
                modified: modified_of(&meta),
            })
            .collect())
    }

    async fn remove_empty_dirs(&self) -> Result<usize> {
        let mut removed = 0;
        for parent in [OBJECTS_DIR, CHUNKS_DIR] {
            let root = self.base_path.join(parent);
            let dirs = list_dirs(&root)
                .await
                .map_err(|e| read_err("scan", &root, e))?;
            for (_, path, _) in dirs {
                let is_empty = match fs::read_dir(&path).await {
                    Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
                    Err(_) => false,
                };
                // remove_dir refuses non-empty directories, so a concurrent
                // write that lands in between is safe.
                if is_empty && fs::remove_dir(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Writer that stages data in `tmp/` and renames it into place on commit.
struct LocalObjectWriter {
    file: Option<BufWriter<fs::File>>,
    temp_path: PathBuf,
    base_path: PathBuf,
    written: u64,
}

impl LocalObjectWriter {
    async fn finish(&mut self, key: &str) -> Result<()> {
        let final_path = resolve_key(&self.base_path, key)?;
        let Some(mut file) = self.file.take() else {
            return Err(FileHostError::StorageWrite(
                "writer already finished".to_string(),
            ));
        };
        file.flush()
            .await
            .map_err(|e| write_err("flush", &self.temp_path, e))?;
        file.get_ref()
            .sync_all()
            .await
            .map_err(|e| write_err("sync", &self.temp_path, e))?;
        drop(file);

        rename_into(&self.temp_path, &final_path)
            .await
            .map_err(|e| write_err("commit", &final_path, e))
    }
}

#[async_trait]
impl ObjectWriter for LocalObjectWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            FileHostError::StorageWrite("writer already finished".to_string())
        })?;
        file.write_all(buf)
            .await
            .map_err(|e| write_err("write", &self.temp_path, e))?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn commit(mut self: Box<Self>, key: &str) -> Result<u64> {
        match self.finish(key).await {
            Ok(()) => {
                debug!(key, size = self.written, "Committed object");
                Ok(self.written)
            }
            Err(e) => {
                if let Err(rm) = remove_if_exists(&self.temp_path).await {
                    warn!(path = %self.temp_path.display(), error = %rm, "Failed to remove temp file");
                }
                Err(e)
            }
        }
    }

    async fn abort(mut self: Box<Self>) {
        self.file.take();
        if let Err(e) = remove_if_exists(&self.temp_path).await {
            warn!(path = %self.temp_path.display(), error = %e, "Failed to remove temp file");
        }
    }
}

impl Drop for LocalObjectWriter {
    fn drop(&mut self) {
        // Still open means neither commit nor abort ran (e.g. the future was cancelled).
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::checksum::checksum_hex;
    use tempfile::TempDir;

    async fn setup_storage() -> (TempDir, LocalStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path()).await.unwrap();
        (temp_dir, storage)
    }

    #[tokio::test]
    async fn test_new_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("storage");

        let storage = LocalStorage::new(&root).await.unwrap();

        assert_eq!(storage.base_path(), root);
        assert!(root.join("objects").is_dir());
        assert!(root.join("chunks").is_dir());
        assert!(root.join("tmp").is_dir());
    }

    #[test]
    fn test_content_key_is_sharded() {
        let sum = checksum_hex(b"abc");
        assert_eq!(content_key(&sum), format!("objects/ba/{sum}"));
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_temp_dir, storage) = setup_storage().await;
        let key = content_key(&checksum_hex(b"Hello, World!"));

        let size = storage.put(&key, b"Hello, World!").await.unwrap();

        assert_eq!(size, 13);
        assert!(storage.exists(&key).await.unwrap());
        assert_eq!(storage.size(&key).await.unwrap(), 13);
        assert_eq!(storage.get(&key).await.unwrap(), b"Hello, World!");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_temp_dir, storage) = setup_storage().await;

        let result = storage.get("objects/aa/missing").await;
        assert!(matches!(result, Err(FileHostError::NotFound(_))));
        assert!(matches!(
            storage.size("objects/aa/missing").await,
            Err(FileHostError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_temp_dir, storage) = setup_storage().await;
        storage.put("objects/ab/abcdef", b"data").await.unwrap();

        assert!(storage.delete("objects/ab/abcdef").await.unwrap());
        assert!(!storage.delete("objects/ab/abcdef").await.unwrap());
        assert!(!storage.exists("objects/ab/abcdef").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_temp_dir, storage) = setup_storage().await;

        for key in ["", "/etc/passwd", "../outside", "objects/../../x", "a//b", "a\\b"] {
            let result = storage.put(key, b"x").await;
            assert!(
                matches!(result, Err(FileHostError::InvalidArgument(_))),
                "key {key:?} should be rejected"
            );
        }
        // Rejected writes leave no temp files
        assert!(storage.list_temp().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible() {
        let (_temp_dir, storage) = setup_storage().await;

        let mut writer = storage.create().await.unwrap();
        writer.write(b"partial").await.unwrap();
        assert_eq!(writer.written(), 7);
        assert!(storage.list_objects().await.unwrap().is_empty());
        assert_eq!(storage.list_temp().await.unwrap().len(), 1);

        writer.abort().await;
        assert!(storage.list_temp().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_writer_cleans_up() {
        let (_temp_dir, storage) = setup_storage().await;

        let mut writer = storage.create().await.unwrap();
        writer.write(b"partial").await.unwrap();
        drop(writer);

        assert!(storage.list_temp().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_existing() {
        let (_temp_dir, storage) = setup_storage().await;
        storage.put("objects/aa/same", b"first").await.unwrap();
        storage.put("objects/aa/same", b"second").await.unwrap();

        assert_eq!(storage.get("objects/aa/same").await.unwrap(), b"second");
        assert_eq!(storage.list_objects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chunks_round_trip() {
        let (_temp_dir, storage) = setup_storage().await;

        storage.put_chunk("sess-1", 1, b"world").await.unwrap();
        storage.put_chunk("sess-1", 0, b"hello").await.unwrap();
        // Re-upload replaces
        storage.put_chunk("sess-1", 0, b"HELLO").await.unwrap();

        let mut reader = storage.open_chunk("sess-1", 0).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"HELLO");

        let sets = storage.list_chunk_sessions().await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].key, "sess-1");
        assert_eq!(sets[0].size, 10);

        assert_eq!(storage.delete_chunks("sess-1").await.unwrap(), 2);
        assert_eq!(storage.delete_chunks("sess-1").await.unwrap(), 0);
        assert!(storage.list_chunk_sessions().await.unwrap().is_empty());
        assert!(matches!(
            storage.open_chunk("sess-1", 0).await,
            Err(FileHostError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_session_id_validated() {
        let (_temp_dir, storage) = setup_storage().await;

        let result = storage.put_chunk("../escape", 0, b"x").await;
        assert!(matches!(result, Err(FileHostError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_list_objects() {
        let (_temp_dir, storage) = setup_storage().await;
        let a = content_key(&checksum_hex(b"a"));
        let b = content_key(&checksum_hex(b"b"));
        storage.put(&a, b"a").await.unwrap();
        storage.put(&b, b"bb").await.unwrap();

        let mut keys: Vec<_> = storage
            .list_objects()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_remove_empty_dirs() {
        let (_temp_dir, storage) = setup_storage().await;
        storage.put("objects/aa/one", b"1").await.unwrap();
        storage.put("objects/bb/two", b"2").await.unwrap();
        storage.put_chunk("s1", 0, b"x").await.unwrap();

        storage.delete("objects/aa/one").await.unwrap();
        std::fs::remove_file(storage.base_path().join("chunks/s1/00000000.chunk")).unwrap();

        assert_eq!(storage.remove_empty_dirs().await.unwrap(), 2);
        assert!(!storage.base_path().join("objects/aa").exists());
        assert!(storage.base_path().join("objects/bb").exists());
        assert!(!storage.base_path().join("chunks/s1").exists());

        // Writes into a removed shard recreate it
        storage.put("objects/aa/three", b"3").await.unwrap();
        assert!(storage.exists("objects/aa/three").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_hashed_enforces_limit() {
        let (_temp_dir, storage) = setup_storage().await;
        let data = vec![1u8; 1000];

        let mut writer = storage.create().await.unwrap();
        let mut checksum = Checksum::new();
        let result = copy_hashed(
            &mut &data[..],
            writer.as_mut(),
            &mut checksum,
            Some(999),
            FileHostError::Io,
        )
        .await;
        assert!(matches!(result, Err(FileHostError::InvalidArgument(_))));
        writer.abort().await;

        let mut writer = storage.create().await.unwrap();
        let mut checksum = Checksum::new();
        let copied = copy_hashed(
            &mut &data[..],
            writer.as_mut(),
            &mut checksum,
            Some(1000),
            FileHostError::Io,
        )
        .await
        .unwrap();
        assert_eq!(copied, 1000);
        assert_eq!(checksum.finalize(), checksum_hex(&data));
        writer.abort().await;
    }
}
