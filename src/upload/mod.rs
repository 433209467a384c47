//! Chunked, resumable uploads.
//!
//! A client registers an upload session, sends chunks in any order and
//! finalizes once every chunk has arrived. Assembly streams the chunks through
//! the checksum engine into content-addressed storage.

mod manager;
mod session;

pub use manager::{ChunkAccepted, CreateSession, SessionStatus, UploadSessionManager};
pub use session::{expected_chunk_count, UploadSession, UploadSessionRepository};
