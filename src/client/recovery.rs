//! Durable resume pointers for in-flight upload sessions.
//!
//! One small record per session survives a process restart and lets the
//! uploader pick up at the last acknowledged chunk instead of byte zero. The
//! store is deliberately an interface so the engine stays storage-agnostic;
//! the file-backed implementation below is what the CLI uses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

/// Resume pointer for one upload session.
///
/// Written after session creation and after every acknowledged chunk,
/// deleted on completion or cancellation. `current_chunk` is the client's
/// last-known next index; the server's count wins on reconciliation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub session_id: Uuid,
    pub filename: String,
    /// Destination path on the server.
    pub path: String,
    /// Local file to reopen when resuming.
    pub source: PathBuf,
    pub current_chunk: u64,
}

/// Durable key-value persistence of recovery records, keyed by session id.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn save(&self, record: &RecoveryRecord) -> Result<()>;
    async fn load(&self, session_id: Uuid) -> Result<Option<RecoveryRecord>>;
    async fn delete(&self, session_id: Uuid) -> Result<()>;
    /// All pending records, read once at startup.
    async fn list(&self) -> Result<Vec<RecoveryRecord>>;
}

/// File-backed store: one JSON document per session under a state directory.
pub struct FileRecoveryStore {
    dir: PathBuf,
}

impl FileRecoveryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("upload_{}.json", session_id))
    }
}

#[async_trait]
impl RecoveryStore for FileRecoveryStore {
    async fn save(&self, record: &RecoveryRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state directory {}", self.dir.display()))?;
        let body = serde_json::to_vec(record)?;
        // write-then-rename so a crash mid-write never leaves a torn record
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, self.record_path(record.session_id)).await?;
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<RecoveryRecord>> {
        let path = self.record_path(session_id);
        match fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing recovery record {}", path.display()))?;
                Ok(Some(record))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        match fs::remove_file(self.record_path(session_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<RecoveryRecord>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!("skipping unreadable recovery record {}: {}", path.display(), err);
                }
            }
        }
        Ok(records)
    }
}

async fn read_record(path: &Path) -> Result<RecoveryRecord> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryRecoveryStore {
    records: Mutex<HashMap<Uuid, RecoveryRecord>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryStore for MemoryRecoveryStore {
    async fn save(&self, record: &RecoveryRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.session_id, record.clone());
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<RecoveryRecord>> {
        Ok(self.records.lock().unwrap().get(&session_id).cloned())
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        self.records.lock().unwrap().remove(&session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RecoveryRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(current_chunk: u64) -> RecoveryRecord {
        RecoveryRecord {
            session_id: Uuid::new_v4(),
            filename: "video.bin".into(),
            path: "media/video.bin".into(),
            source: PathBuf::from("/tmp/video.bin"),
            current_chunk,
        }
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(dir.path());
        let rec = record(3);

        store.save(&rec).await.unwrap();
        assert_eq!(store.load(rec.session_id).await.unwrap(), Some(rec.clone()));

        // overwriting advances the pointer
        let advanced = RecoveryRecord {
            current_chunk: 4,
            ..rec.clone()
        };
        store.save(&advanced).await.unwrap();
        assert_eq!(
            store.load(rec.session_id).await.unwrap(),
            Some(advanced.clone())
        );

        store.delete(rec.session_id).await.unwrap();
        assert_eq!(store.load(rec.session_id).await.unwrap(), None);
        // deleting again is fine
        store.delete(rec.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_all_pending_records() {
        let dir = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(dir.path());
        let a = record(1);
        let b = record(2);
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let mut listed = store.list().await.unwrap();
        listed.sort_by_key(|r| r.current_chunk);
        assert_eq!(listed, vec![a, b]);
    }

    #[tokio::test]
    async fn list_on_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileRecoveryStore::new(dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
