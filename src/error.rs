//! Error types for filehost.

use std::time::Duration;

use thiserror::Error;

/// Common error type for filehost.
#[derive(Error, Debug)]
pub enum FileHostError {
    /// Malformed request parameters. Rejected before any state change.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown or expired file.
    #[error("{0} not found")]
    NotFound(String),

    /// Unknown upload session.
    #[error("upload session {0} not found")]
    SessionNotFound(String),

    /// The upload session expired before the request arrived.
    ///
    /// Discovering this discards the session.
    #[error("upload session {0} has expired")]
    SessionExpired(String),

    /// Chunk index outside `[0, expected_chunk_count)`.
    #[error("chunk index {index} is out of range (session expects {expected} chunks)")]
    InvalidChunkIndex {
        /// Index sent by the client.
        index: u64,
        /// Number of chunks the session expects.
        expected: u64,
    },

    /// Chunk payload length does not match the length expected for its index.
    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        /// Index sent by the client.
        index: u64,
        /// Expected byte length for this index.
        expected: u64,
        /// Byte length actually received.
        actual: u64,
    },

    /// Storage backend failed while writing or deleting.
    #[error("storage write error: {0}")]
    StorageWrite(String),

    /// Storage backend failed while reading.
    #[error("storage read error: {0}")]
    StorageRead(String),

    /// Metadata store error.
    ///
    /// Errors from sqlx are converted automatically.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// I/O error outside the storage backend (config files, log files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The caller exceeded its upload quota.
    #[error("rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the quota allows another request.
        retry_after: Duration,
    },
}

impl FileHostError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FileHostError::StorageWrite(_)
                | FileHostError::StorageRead(_)
                | FileHostError::Metadata(_)
                | FileHostError::RateLimited { .. }
        )
    }
}

impl From<sqlx::Error> for FileHostError {
    fn from(e: sqlx::Error) -> Self {
        FileHostError::Metadata(e.to_string())
    }
}

/// Result type alias for filehost operations.
pub type Result<T> = std::result::Result<T, FileHostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_chunk_index_display() {
        let err = FileHostError::InvalidChunkIndex {
            index: 5,
            expected: 3,
        };
        assert_eq!(
            err.to_string(),
            "chunk index 5 is out of range (session expects 3 chunks)"
        );
    }

    #[test]
    fn test_chunk_size_mismatch_display() {
        let err = FileHostError::ChunkSizeMismatch {
            index: 2,
            expected: 200,
            actual: 400,
        };
        assert_eq!(err.to_string(), "chunk 2 is 400 bytes, expected 200");
    }

    #[test]
    fn test_not_found_display() {
        let err = FileHostError::NotFound("file abc".to_string());
        assert_eq!(err.to_string(), "file abc not found");
    }

    #[test]
    fn test_rate_limited_display() {
        let err = FileHostError::RateLimited {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 1500ms");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FileHostError::StorageWrite("disk full".into()).is_retryable());
        assert!(FileHostError::StorageRead("eio".into()).is_retryable());
        assert!(FileHostError::Metadata("locked".into()).is_retryable());
        assert!(!FileHostError::InvalidArgument("bad".into()).is_retryable());
        assert!(!FileHostError::SessionExpired("s".into()).is_retryable());
        assert!(!FileHostError::InvalidChunkIndex {
            index: 1,
            expected: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config.toml");
        let err: FileHostError = io_err.into();
        assert!(matches!(err, FileHostError::Io(_)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: FileHostError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, FileHostError::Metadata(_)));
    }
}
