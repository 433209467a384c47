//! Database schema and migrations for filehost.
//!
//! Migrations are applied in order when the database is opened. The
//! `schema_version` table records which ones have run.
//!
//! All timestamps are INTEGER Unix milliseconds.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: file records and upload sessions
    r#"
CREATE TABLE files (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id         TEXT NOT NULL UNIQUE,
    original_name   TEXT NOT NULL,
    mime_type       TEXT NOT NULL,
    file_size       INTEGER NOT NULL CHECK (file_size >= 0),
    checksum        TEXT NOT NULL,
    storage_path    TEXT NOT NULL,          -- content-addressed; shared by duplicates
    expires_at      INTEGER,                -- NULL = never expires
    created_at      INTEGER NOT NULL
);

CREATE INDEX idx_files_expires_at ON files(expires_at);
CREATE INDEX idx_files_storage_path ON files(storage_path);
CREATE INDEX idx_files_checksum ON files(checksum);

CREATE TABLE upload_sessions (
    session_id      TEXT PRIMARY KEY,
    original_name   TEXT NOT NULL,
    mime_type       TEXT,
    total_size      INTEGER NOT NULL CHECK (total_size > 0),
    chunk_size      INTEGER NOT NULL CHECK (chunk_size > 0),
    file_ttl_secs   INTEGER,                -- NULL = stored file never expires
    expires_at      INTEGER NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE INDEX idx_upload_sessions_expires_at ON upload_sessions(expires_at);

CREATE TABLE upload_chunks (
    session_id      TEXT NOT NULL REFERENCES upload_sessions(session_id) ON DELETE CASCADE,
    chunk_index     INTEGER NOT NULL CHECK (chunk_index >= 0),
    received_at     INTEGER NOT NULL,
    PRIMARY KEY (session_id, chunk_index)
);
"#,
];
