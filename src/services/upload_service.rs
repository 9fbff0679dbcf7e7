//! src/services/upload_service.rs
//!
//! UploadService — resumable upload sessions backed by SQLite for session
//! metadata and local disk for payloads. Chunks are staged beneath
//! `staging_dir/{session_id}/chunk_{index}` and assembled into
//! `root_dir/{path}` once every chunk has arrived. Small files skip the
//! session machinery entirely and stream straight to their destination.

use crate::chunker::ChunkPlan;
use crate::models::session::{SessionStatus, UploadSession};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("upload session `{0}` has expired")]
    SessionExpired(Uuid),
    #[error("chunk index {index} out of range (session has {total} chunks)")]
    ChunkOutOfRange { index: i64, total: i64 },
    #[error("chunk size mismatch: expected {expected} bytes, got {actual}")]
    ChunkSizeMismatch { expected: i64, actual: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

const MAX_PATH_LEN: usize = 1024;

/// Default chunk size handed to new sessions: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: i64 = 5 * 1024 * 1024;

/// Incomplete sessions are swept this long after creation.
pub const SESSION_TTL_HOURS: i64 = 24;

/// UploadService provides the resumable upload contract:
/// - Create a session (chunk plan + staging directory + metadata row)
/// - Accept chunks idempotently, assembling the file on the last one
/// - Report progress for client-side recovery reconciliation
/// - Cancel sessions and sweep expired ones
/// - Stream single-shot uploads directly to their destination
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for session metadata.
    pub db: Arc<SqlitePool>,

    /// Directory completed files are assembled under.
    pub root_dir: PathBuf,

    /// Directory holding per-session chunk staging subdirectories.
    pub staging_dir: PathBuf,

    chunk_size: i64,
    session_ttl: Duration,

    // One writer per session id at a time. Chunk writes are idempotent, but
    // the uploaded_chunks counter and final assembly must not race.
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl UploadService {
    /// Create a new UploadService with the default chunk size and TTL.
    pub fn new(
        db: Arc<SqlitePool>,
        root_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::with_chunk_size(db, root_dir, staging_dir, DEFAULT_CHUNK_SIZE)
    }

    /// Same as [`new`](Self::new) but with an explicit chunk size.
    pub fn with_chunk_size(
        db: Arc<SqlitePool>,
        root_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        chunk_size: i64,
    ) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");
        Self {
            db,
            root_dir: root_dir.into(),
            staging_dir: staging_dir.into(),
            chunk_size,
            session_ttl: Duration::hours(SESSION_TTL_HOURS),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Basic destination-path validation to keep writes under `root_dir`.
    ///
    /// Accepts a leading `/` (clients send absolute-looking browser paths)
    /// and returns the normalized relative form.
    fn ensure_path_safe(&self, path: &str) -> UploadResult<String> {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            return Err(UploadError::InvalidRequest(
                "destination path is required".into(),
            ));
        }
        if rel.len() > MAX_PATH_LEN {
            return Err(UploadError::InvalidRequest(
                "destination path too long".into(),
            ));
        }
        if rel.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(UploadError::InvalidRequest(
                "destination path may not contain empty, `.` or `..` segments".into(),
            ));
        }
        if rel
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(UploadError::InvalidRequest(
                "destination path contains forbidden characters".into(),
            ));
        }
        Ok(rel.to_string())
    }

    fn session_staging_dir(&self, id: Uuid) -> PathBuf {
        self.staging_dir.join(id.to_string())
    }

    fn chunk_path(temp_dir: &Path, index: i64) -> PathBuf {
        temp_dir.join(format!("chunk_{}", index))
    }

    /// Serialize access to a single session. The entry is dropped when the
    /// session reaches a terminal state.
    async fn session_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    async fn release_lock(&self, id: Uuid) {
        self.locks.lock().await.remove(&id);
    }

    /// Fetch a session row, mapping a missing row to `SessionNotFound`.
    async fn fetch_session(&self, id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, filename, path, total_size, uploaded_size, chunk_size, total_chunks,
                    uploaded_chunks, status, etag, temp_dir, created_at, updated_at, expires_at
             FROM upload_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::SessionNotFound(id),
            other => UploadError::Sqlx(other),
        })
    }

    async fn persist_session(&self, session: &UploadSession) -> UploadResult<()> {
        sqlx::query(
            "UPDATE upload_sessions
             SET uploaded_size = ?, uploaded_chunks = ?, status = ?, etag = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(session.uploaded_size)
        .bind(session.uploaded_chunks)
        .bind(session.status)
        .bind(&session.etag)
        .bind(session.updated_at)
        .bind(session.id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Create a new upload session.
    ///
    /// Computes the chunk plan, allocates the staging directory and inserts
    /// the metadata row with `status = uploading`.
    pub async fn create_session(
        &self,
        filename: &str,
        path: &str,
        size: i64,
    ) -> UploadResult<UploadSession> {
        if filename.trim().is_empty() {
            return Err(UploadError::InvalidRequest("filename is required".into()));
        }
        if size <= 0 {
            return Err(UploadError::InvalidRequest(
                "size must be greater than zero".into(),
            ));
        }
        let rel_path = self.ensure_path_safe(path)?;

        let id = Uuid::new_v4();
        let plan = ChunkPlan::new(size as u64, self.chunk_size as u64);
        let temp_dir = self.session_staging_dir(id);
        fs::create_dir_all(&temp_dir).await?;

        let now = Utc::now();
        let session = UploadSession {
            id,
            filename: filename.to_string(),
            path: rel_path,
            total_size: size,
            uploaded_size: 0,
            chunk_size: self.chunk_size,
            total_chunks: plan.total_chunks() as i64,
            uploaded_chunks: 0,
            status: SessionStatus::Uploading,
            etag: None,
            temp_dir: temp_dir.to_string_lossy().into_owned(),
            created_at: now,
            updated_at: now,
            expires_at: now + self.session_ttl,
        };

        let insert = sqlx::query(
            "INSERT INTO upload_sessions (
                id, filename, path, total_size, uploaded_size, chunk_size, total_chunks,
                uploaded_chunks, status, etag, temp_dir, created_at, updated_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.filename)
        .bind(&session.path)
        .bind(session.total_size)
        .bind(session.uploaded_size)
        .bind(session.chunk_size)
        .bind(session.total_chunks)
        .bind(session.uploaded_chunks)
        .bind(session.status)
        .bind(&session.etag)
        .bind(&session.temp_dir)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&*self.db)
        .await;

        if let Err(err) = insert {
            let _ = fs::remove_dir_all(&temp_dir).await;
            return Err(UploadError::Sqlx(err));
        }

        info!(
            session = %session.id,
            filename = %session.filename,
            total_chunks = session.total_chunks,
            "created upload session"
        );
        Ok(session)
    }

    /// Accept one chunk of a session — idempotently.
    ///
    /// Re-submitting an index that was already written (a retry whose
    /// acknowledgment was lost) rewrites the same staging file and leaves the
    /// counters untouched, so the assembled result cannot be corrupted by
    /// duplicate deliveries. When the last outstanding chunk lands, the file
    /// is assembled at its destination and the session completes.
    pub async fn upload_chunk(
        &self,
        id: Uuid,
        index: i64,
        bytes: Bytes,
    ) -> UploadResult<UploadSession> {
        let lock = self.session_lock(id).await;
        let _guard = lock.lock().await;

        let mut session = self.fetch_session(id).await?;
        if session.is_expired(Utc::now()) {
            return Err(UploadError::SessionExpired(id));
        }
        if index < 0 || index >= session.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index,
                total: session.total_chunks,
            });
        }

        let plan = ChunkPlan::new(session.total_size as u64, session.chunk_size as u64);
        let expected = plan.len_of(index as u64).unwrap_or(0) as i64;
        if bytes.len() as i64 != expected {
            return Err(UploadError::ChunkSizeMismatch {
                expected,
                actual: bytes.len() as i64,
            });
        }

        // A duplicate of the final chunk can arrive after assembly if the
        // completing acknowledgment was lost. Staging is gone by then; the
        // completed session itself is the correct answer.
        if session.status == SessionStatus::Completed {
            return Ok(session);
        }

        let temp_dir = PathBuf::from(&session.temp_dir);
        let chunk_path = Self::chunk_path(&temp_dir, index);
        let already_written = fs::try_exists(&chunk_path).await.unwrap_or(false);

        let tmp_path = temp_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = file.write_all(&bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        drop(file);
        if let Err(err) = fs::rename(&tmp_path, &chunk_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        if !already_written {
            session.uploaded_chunks += 1;
            session.uploaded_size += expected;
        }
        session.updated_at = Utc::now();
        debug!(
            session = %id,
            chunk = index,
            uploaded = session.uploaded_chunks,
            total = session.total_chunks,
            rewrite = already_written,
            "stored chunk"
        );

        if session.uploaded_chunks >= session.total_chunks {
            if session.uploaded_size != session.total_size {
                return Err(UploadError::Io(io::Error::other(format!(
                    "staging size mismatch: expected {} bytes, have {}",
                    session.total_size, session.uploaded_size
                ))));
            }
            let etag = self.assemble(&session).await?;
            session.status = SessionStatus::Completed;
            session.etag = Some(etag);
            session.updated_at = Utc::now();
            info!(session = %id, path = %session.path, "upload complete, file assembled");
        }

        self.persist_session(&session).await?;

        if session.status == SessionStatus::Completed {
            drop(_guard);
            self.release_lock(id).await;
        }
        Ok(session)
    }

    /// Concatenate staged chunks into the final file.
    ///
    /// Writes through a temp file in the destination directory, fsyncs and
    /// renames into place, then discards the staging directory. Returns the
    /// MD5 of the assembled bytes.
    async fn assemble(&self, session: &UploadSession) -> UploadResult<String> {
        let final_path = self.root_dir.join(&session.path);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::Io(io::Error::other("destination path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let temp_dir = PathBuf::from(&session.temp_dir);
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;
        let mut digest = Context::new();

        for index in 0..session.total_chunks {
            let chunk = match fs::read(Self::chunk_path(&temp_dir, index)).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Io(err));
                }
            };
            digest.consume(&chunk);
            if let Err(err) = out.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }
        if let Err(err) = out.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = out.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        drop(out);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&final_path).await?;
                fs::rename(&tmp_path, &final_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        if let Err(err) = fs::remove_dir_all(&temp_dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove staging dir {} after assembly: {}",
                    temp_dir.display(),
                    err
                );
            }
        }

        Ok(format!("{:x}", digest.compute()))
    }

    /// Read-only session snapshot, used by clients to reconcile recovery
    /// state after a restart.
    pub async fn get_session(&self, id: Uuid) -> UploadResult<UploadSession> {
        self.fetch_session(id).await
    }

    /// Cancel a session: discard staging storage and delete the row.
    ///
    /// Idempotent — cancelling an unknown (already-cancelled) session is a
    /// no-op success.
    pub async fn cancel_session(&self, id: Uuid) -> UploadResult<()> {
        let session = match self.fetch_session(id).await {
            Ok(session) => session,
            Err(UploadError::SessionNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        if let Err(err) = fs::remove_dir_all(&session.temp_dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove staging dir {} on cancel: {}",
                    session.temp_dir, err
                );
            }
        }

        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        self.release_lock(id).await;
        info!(session = %id, "upload session cancelled");
        Ok(())
    }

    /// Delete expired, incomplete sessions and their staging directories.
    /// Returns how many were removed.
    pub async fn sweep_expired(&self) -> UploadResult<u64> {
        let expired = sqlx::query_as::<_, UploadSession>(
            "SELECT id, filename, path, total_size, uploaded_size, chunk_size, total_chunks,
                    uploaded_chunks, status, etag, temp_dir, created_at, updated_at, expires_at
             FROM upload_sessions WHERE expires_at < ? AND status != 'completed'",
        )
        .bind(Utc::now())
        .fetch_all(&*self.db)
        .await?;

        let mut removed = 0u64;
        for session in expired {
            if let Err(err) = fs::remove_dir_all(&session.temp_dir).await {
                if err.kind() != ErrorKind::NotFound {
                    debug!(
                        "failed to remove staging dir {} for expired session {}: {}",
                        session.temp_dir, session.id, err
                    );
                }
            }
            sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
                .bind(session.id)
                .execute(&*self.db)
                .await?;
            self.release_lock(session.id).await;
            removed += 1;
        }
        if removed > 0 {
            info!(count = removed, "swept expired upload sessions");
        }
        Ok(removed)
    }

    /// Stream a single-shot upload straight to its destination.
    ///
    /// Small files bypass the session machinery; this writes the body
    /// incrementally to a temp file, computes the MD5 etag, fsyncs and
    /// atomically renames into place. Returns the byte count and etag.
    pub async fn write_resource<S>(&self, path: &str, stream: S) -> UploadResult<(i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let rel_path = self.ensure_path_safe(path)?;
        let final_path = self.root_dir.join(&rel_path);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::Io(io::Error::other("destination path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Io(err));
                }
            };
            size += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&final_path).await?;
                fs::rename(&tmp_path, &final_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        Ok((size, format!("{:x}", digest.compute())))
    }
}
