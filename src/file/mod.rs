//! File management module for filehost.
//!
//! This module provides the stored-file side of the system:
//! - Content-addressed storage with deduplication
//! - SHA-256 checksums
//! - File records with optional expiry
//! - Single-shot uploads and the download path

pub mod checksum;
mod record;
pub(crate) mod service;
pub mod storage;

use std::time::Duration;

pub use checksum::{checksum_hex, Checksum};
pub use record::{generate_file_id, FileRecord, FileRecordRepository, NewFileRecord, FILE_ID_LEN};
pub use service::{FileService, StoreFile};
pub use storage::{content_key, LocalStorage, ObjectReader, ObjectWriter, StorageBackend, StoredObject};

use crate::{FileHostError, Result};

/// Maximum length for an original filename (in characters).
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Fallback MIME type when nothing better is known.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// How long a stored file is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Use the configured default file lifetime.
    #[default]
    Default,
    /// Keep until explicitly deleted.
    Never,
    /// Expire after the given duration.
    For(Duration),
}

impl Retention {
    /// Resolve to a concrete lifetime. `None` means the file never expires.
    pub fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Retention::Default => default,
            Retention::Never => None,
            Retention::For(ttl) => Some(ttl),
        }
    }
}

/// Size and lifetime limits shared by single-shot and chunked uploads.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// Maximum stored file size in bytes.
    pub max_file_size: u64,
    /// Maximum declared chunk size in bytes.
    pub max_chunk_size: u64,
    /// Maximum number of chunks in one session.
    pub max_chunk_count: u64,
    /// Upload session lifetime when the client does not pick one.
    pub session_ttl: Duration,
    /// File lifetime for [`Retention::Default`]. `None` means never.
    pub default_file_ttl: Option<Duration>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        crate::config::UploadsConfig::default().limits()
    }
}

/// Validate an original filename.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FileHostError::InvalidArgument(
            "filename must not be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_FILENAME_LENGTH {
        return Err(FileHostError::InvalidArgument(format!(
            "filename must be at most {MAX_FILENAME_LENGTH} characters"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(FileHostError::InvalidArgument(
            "filename must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Pick the MIME type for a file: the client's value if given, else a guess from the name.
pub fn resolve_mime_type(original_name: &str, declared: Option<&str>) -> String {
    match declared.map(str::trim).filter(|m| !m.is_empty()) {
        Some(mime) => mime.to_string(),
        None => mime_guess::from_path(original_name)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string(),
    }
}
