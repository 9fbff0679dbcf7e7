//! Represents a resumable upload session and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an upload session.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Paused,
    Completed,
    Failed,
}

/// A resumable upload session, created before transferring a large file in
/// fixed-size chunks.
///
/// The same struct is the database row and the JSON wire format: the server
/// returns it from every session endpoint and the client deserializes it as
/// its read-through copy of the authoritative state.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Session identifier, generated at creation, immutable.
    pub id: Uuid,

    /// Name of the file being uploaded.
    pub filename: String,

    /// Destination path (relative to the server root) the file is assembled at.
    pub path: String,

    /// Total size of the file in bytes, fixed at creation.
    pub total_size: i64,

    /// Bytes accumulated from distinct acknowledged chunks.
    pub uploaded_size: i64,

    /// Size of each chunk in bytes, fixed at creation. The last chunk may be
    /// shorter.
    pub chunk_size: i64,

    /// ceil(total_size / chunk_size), computed once at creation.
    pub total_chunks: i64,

    /// Count of distinct chunk indices successfully written. Monotonically
    /// non-decreasing while the session is live.
    pub uploaded_chunks: i64,

    /// Current lifecycle state.
    pub status: SessionStatus,

    /// MD5 of the assembled file, set once the session completes.
    pub etag: Option<String>,

    /// Server-internal staging directory holding received chunks. Opaque to
    /// clients.
    pub temp_dir: String,

    /// Timestamp when the session was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last accepted chunk or status change.
    pub updated_at: DateTime<Utc>,

    /// Incomplete sessions past this instant are terminal and reject writes.
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Whether the session has outlived its expiry without completing.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status != SessionStatus::Completed && now > self.expires_at
    }
}
