//! File record types and repository.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, FromRow, Row, Sqlite};

use crate::datetime::{from_millis, to_millis};
use crate::db::DbPool;
use crate::{FileHostError, Result};

/// Length of a generated external file id.
pub const FILE_ID_LEN: usize = 12;

const RECORD_COLUMNS: &str =
    "id, file_id, original_name, mime_type, file_size, checksum, storage_path, expires_at, created_at";

/// Generate a random base62 file id.
pub fn generate_file_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LEN)
        .map(char::from)
        .collect()
}

/// Metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Internal row id.
    #[serde(skip)]
    pub id: i64,
    /// External identifier handed to clients.
    pub file_id: String,
    /// Filename as uploaded.
    pub original_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub file_size: u64,
    /// SHA-256 of the content, lowercase hex.
    pub checksum: String,
    /// Content-addressed storage key. Shared by records with identical content.
    #[serde(skip)]
    pub storage_path: String,
    /// When the file expires. `None` means never.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the file was stored.
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Whether the record is logically expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl<'r> FromRow<'r, SqliteRow> for FileRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            file_id: row.try_get("file_id")?,
            original_name: row.try_get("original_name")?,
            mime_type: row.try_get("mime_type")?,
            file_size: row.try_get::<i64, _>("file_size")?.max(0) as u64,
            checksum: row.try_get("checksum")?,
            storage_path: row.try_get("storage_path")?,
            expires_at: row.try_get::<Option<i64>, _>("expires_at")?.map(from_millis),
            created_at: from_millis(row.try_get("created_at")?),
        })
    }
}

/// Data for creating a file record.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    /// External identifier.
    pub file_id: String,
    /// Filename as uploaded.
    pub original_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub file_size: u64,
    /// SHA-256 of the content.
    pub checksum: String,
    /// Storage key of the content object.
    pub storage_path: String,
    /// Expiry time, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Repository for file record operations.
pub struct FileRecordRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> FileRecordRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Create a file record.
    ///
    /// Fails if the file id is already taken.
    pub async fn create(&self, record: &NewFileRecord) -> Result<FileRecord> {
        Self::insert(self.pool, record).await?.ok_or_else(|| {
            FileHostError::Metadata(format!("file id {} already exists", record.file_id))
        })
    }

    /// Insert a file record using any executor, so it can join a transaction.
    ///
    /// Returns `None` without touching the table if the file id is taken.
    pub async fn insert<'e, E>(executor: E, record: &NewFileRecord) -> Result<Option<FileRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "INSERT INTO files
             (file_id, original_name, mime_type, file_size, checksum, storage_path, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT(file_id) DO NOTHING
             RETURNING {RECORD_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(&record.file_id)
            .bind(&record.original_name)
            .bind(&record.mime_type)
            .bind(record.file_size as i64)
            .bind(&record.checksum)
            .bind(&record.storage_path)
            .bind(record.expires_at.map(to_millis))
            .bind(to_millis(record.created_at))
            .fetch_optional(executor)
            .await?;
        Ok(inserted)
    }

    /// Get a record by external id, regardless of expiry.
    pub async fn get_by_file_id(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE file_id = $1");
        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(file_id)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Records with `expires_at <= now`, oldest expiry first.
    ///
    /// `after` is the `(expires_at, id)` of the last record of the previous
    /// page; rows at or before it are skipped so a caller can page past rows it
    /// failed to delete.
    pub async fn list_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<(DateTime<Utc>, i64)>,
        limit: u32,
    ) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM files
             WHERE expires_at IS NOT NULL AND expires_at <= $1
               AND ($2 IS NULL OR expires_at > $2 OR (expires_at = $2 AND id > $3))
             ORDER BY expires_at, id
             LIMIT $4"
        );
        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(to_millis(now))
            .bind(after.map(|(at, _)| to_millis(at)))
            .bind(after.map(|(_, id)| id))
            .bind(i64::from(limit))
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }

    /// Delete a record. Returns `false` if it was already gone.
    pub async fn delete_by_file_id(&self, file_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE file_id = $1")
            .bind(file_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of records pointing at a storage object.
    pub async fn count_by_storage_path(&self, storage_path: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE storage_path = $1")
            .bind(storage_path)
            .fetch_one(self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Number of records other than `file_id` pointing at a storage object.
    pub async fn count_other_references(&self, storage_path: &str, file_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files WHERE storage_path = $1 AND file_id != $2",
        )
        .bind(storage_path)
        .bind(file_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Every storage path referenced by at least one record.
    pub async fn storage_paths(&self) -> Result<HashSet<String>> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT DISTINCT storage_path FROM files")
            .fetch_all(self.pool)
            .await?;
        Ok(paths.into_iter().collect())
    }

    /// Up to `limit` random records, for integrity spot checks.
    pub async fn sample(&self, limit: u32) -> Result<Vec<FileRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files ORDER BY RANDOM() LIMIT $1");
        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(i64::from(limit))
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }

    /// Number of records.
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Sum of logical file sizes (duplicates counted once per record).
    pub async fn total_size(&self) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(file_size), 0) FROM files")
            .fetch_one(self.pool)
            .await?;
        Ok(total as u64)
    }
}
