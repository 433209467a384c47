//! Upload session types and repository.
//!
//! A session tracks one chunked upload. The set of received chunk indices is
//! stored one row per index in `upload_chunks`; adding an index is a single
//! conflict-ignoring insert, so concurrent chunk arrivals never lose updates.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, FromRow, Row, Sqlite};

use crate::datetime::{from_millis, to_millis};
use crate::db::DbPool;
use crate::Result;

const SESSION_COLUMNS: &str =
    "session_id, original_name, mime_type, total_size, chunk_size, file_ttl_secs, expires_at, created_at";

/// Number of chunks needed to carry `total_size` bytes in `chunk_size` pieces.
pub fn expected_chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// An in-progress chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSession {
    /// Session identifier (UUID v4).
    pub session_id: String,
    /// Filename the assembled file will carry.
    pub original_name: String,
    /// MIME type declared by the client, if any.
    pub mime_type: Option<String>,
    /// Declared total size in bytes.
    pub total_size: u64,
    /// Size of every chunk except possibly the last.
    pub chunk_size: u64,
    /// Lifetime of the resulting file in seconds. `None` means never expires.
    pub file_ttl_secs: Option<u64>,
    /// When the session expires.
    pub expires_at: DateTime<Utc>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Number of chunks this session expects.
    pub fn expected_chunk_count(&self) -> u64 {
        expected_chunk_count(self.total_size, self.chunk_size)
    }

    /// Byte length the chunk at `index` must have, or `None` if the index is out of range.
    pub fn expected_chunk_len(&self, index: u64) -> Option<u64> {
        let count = self.expected_chunk_count();
        if index >= count {
            return None;
        }
        if index + 1 < count {
            Some(self.chunk_size)
        } else {
            Some(self.total_size - self.chunk_size * (count - 1))
        }
    }

    /// Whether the session is past its deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether `received` covers every index, in any order.
    pub fn is_complete(&self, received: &[u64]) -> bool {
        let expected = self.expected_chunk_count();
        let covered: BTreeSet<u64> = received.iter().copied().filter(|&i| i < expected).collect();
        covered.len() as u64 == expected
    }

    /// Indices not yet in `received`, ascending.
    pub fn missing_chunks(&self, received: &[u64]) -> Vec<u64> {
        let have: BTreeSet<u64> = received.iter().copied().collect();
        (0..self.expected_chunk_count())
            .filter(|i| !have.contains(i))
            .collect()
    }

    /// Total bytes represented by the received indices.
    pub fn bytes_received(&self, received: &[u64]) -> u64 {
        let unique: BTreeSet<u64> = received.iter().copied().collect();
        unique
            .into_iter()
            .filter_map(|i| self.expected_chunk_len(i))
            .sum()
    }

    /// Lifetime of the file produced by this session.
    pub fn file_ttl(&self) -> Option<Duration> {
        self.file_ttl_secs.map(Duration::from_secs)
    }
}

impl<'r> FromRow<'r, SqliteRow> for UploadSession {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            session_id: row.try_get("session_id")?,
            original_name: row.try_get("original_name")?,
            mime_type: row.try_get("mime_type")?,
            total_size: row.try_get::<i64, _>("total_size")?.max(0) as u64,
            chunk_size: row.try_get::<i64, _>("chunk_size")?.max(0) as u64,
            file_ttl_secs: row
                .try_get::<Option<i64>, _>("file_ttl_secs")?
                .map(|s| s.max(0) as u64),
            expires_at: from_millis(row.try_get("expires_at")?),
            created_at: from_millis(row.try_get("created_at")?),
        })
    }
}

/// Repository for upload sessions and their received chunks.
pub struct UploadSessionRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> UploadSessionRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Persist a new, empty session.
    pub async fn create(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO upload_sessions
             (session_id, original_name, mime_type, total_size, chunk_size, file_ttl_secs, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&session.session_id)
        .bind(&session.original_name)
        .bind(&session.mime_type)
        .bind(session.total_size as i64)
        .bind(session.chunk_size as i64)
        .bind(session.file_ttl_secs.map(|s| s.min(i64::MAX as u64) as i64))
        .bind(to_millis(session.expires_at))
        .bind(to_millis(session.created_at))
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Get a session by id.
    pub async fn get(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE session_id = $1");
        let session = sqlx::query_as::<_, UploadSession>(&sql)
            .bind(session_id)
            .fetch_optional(self.pool)
            .await?;
        Ok(session)
    }

    /// Record a received chunk. Returns `false` if the index was already recorded.
    pub async fn add_chunk(&self, session_id: &str, index: u64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO upload_chunks (session_id, chunk_index, received_at)
             VALUES ($1, $2, $3)
             ON CONFLICT(session_id, chunk_index) DO NOTHING",
        )
        .bind(session_id)
        .bind(index as i64)
        .bind(to_millis(now))
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Received chunk indices, ascending.
    pub async fn received_chunks(&self, session_id: &str) -> Result<Vec<u64>> {
        let indices: Vec<i64> = sqlx::query_scalar(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = $1 ORDER BY chunk_index",
        )
        .bind(session_id)
        .fetch_all(self.pool)
        .await?;
        Ok(indices.into_iter().map(|i| i as u64).collect())
    }

    /// Number of distinct chunks received.
    pub async fn count_chunks(&self, session_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Delete a session and, by cascade, its chunk rows.
    ///
    /// Takes any executor so assembly can do this inside its commit transaction.
    /// Returns `false` if the session did not exist.
    pub async fn delete<'e, E>(executor: E, session_id: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM upload_sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sessions with `expires_at <= now`, oldest first.
    ///
    /// `after` is the `(expires_at, session_id)` of the last session of the
    /// previous page.
    pub async fn list_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<(DateTime<Utc>, &str)>,
        limit: u32,
    ) -> Result<Vec<UploadSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions
             WHERE expires_at <= $1
               AND ($2 IS NULL OR expires_at > $2 OR (expires_at = $2 AND session_id > $3))
             ORDER BY expires_at, session_id
             LIMIT $4"
        );
        let sessions = sqlx::query_as::<_, UploadSession>(&sql)
            .bind(to_millis(now))
            .bind(after.map(|(at, _)| to_millis(at)))
            .bind(after.map(|(_, id)| id))
            .bind(i64::from(limit))
            .fetch_all(self.pool)
            .await?;
        Ok(sessions)
    }

    /// Ids of every live session.
    pub async fn session_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT session_id FROM upload_sessions")
            .fetch_all(self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Number of live sessions.
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(self.pool)
            .await?;
        Ok(count as u64)
    }
}
