//! Sequential upload queue with pause/resume/cancel controls.
//!
//! Files are processed one at a time: a file runs to a terminal state
//! (completed, paused, failed) before the next begins. Sequencing is a
//! policy choice of this coordinator, not of the uploader — bounded
//! parallelism could replace the worker loop without touching
//! `ChunkUploader`.

use super::api::{TransferError, UploadApi};
use super::recovery::RecoveryStore;
use super::retry::RetryPolicy;
use super::uploader::{
    ChunkUploader, RESUMABLE_THRESHOLD, SharedItems, UploadEvent, UploadItem, UploadState,
};
use crate::models::session::SessionStatus;
use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct UploadQueueCoordinator {
    api: UploadApi,
    store: Arc<dyn RecoveryStore>,
    policy: RetryPolicy,
    threshold: u64,
    items: SharedItems,
    order: Arc<StdMutex<Vec<Uuid>>>,
    tokens: Arc<StdMutex<HashMap<Uuid, CancellationToken>>>,
    work_tx: mpsc::UnboundedSender<Uuid>,
    work_rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    events: mpsc::UnboundedSender<UploadEvent>,
}

impl UploadQueueCoordinator {
    /// Build a coordinator and hand back the event stream its single
    /// subscriber consumes.
    pub fn new(
        api: UploadApi,
        store: Arc<dyn RecoveryStore>,
        policy: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        Self::with_threshold(api, store, policy, RESUMABLE_THRESHOLD)
    }

    pub fn with_threshold(
        api: UploadApi,
        store: Arc<dyn RecoveryStore>,
        policy: RetryPolicy,
        threshold: u64,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                api,
                store,
                policy,
                threshold,
                items: Arc::new(StdMutex::new(HashMap::new())),
                order: Arc::new(StdMutex::new(Vec::new())),
                tokens: Arc::new(StdMutex::new(HashMap::new())),
                work_tx,
                work_rx: Mutex::new(work_rx),
                events,
            },
            event_rx,
        )
    }

    /// Queue a local file for upload into `dest_dir` on the server.
    pub async fn enqueue(&self, source: impl Into<PathBuf>, dest_dir: &str) -> Result<Uuid> {
        let source = source.into();
        let metadata = tokio::fs::metadata(&source)
            .await
            .with_context(|| format!("reading {}", source.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", source.display());
        }
        let filename = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("{} has no usable file name", source.display()))?;
        let dest_path = join_dest(dest_dir, &filename);

        let item = UploadItem::new(source, filename, dest_path, metadata.len());
        let id = item.id;
        self.items.lock().unwrap().insert(id, item);
        self.order.lock().unwrap().push(id);
        self.tokens
            .lock()
            .unwrap()
            .insert(id, CancellationToken::new());
        let _ = self.events.send(UploadEvent::Queued { item: id });
        let _ = self.work_tx.send(id);
        Ok(id)
    }

    /// Worker loop: drains the queue one file at a time. Runs until the
    /// coordinator is dropped; spawn it once.
    pub async fn run(&self) {
        let mut rx = self.work_rx.lock().await;
        while let Some(id) = rx.recv().await {
            let Some(item) = self.items.lock().unwrap().get(&id).cloned() else {
                continue; // cancelled while queued
            };
            if item.status != UploadState::Pending {
                continue; // stale queue entry
            }

            let token = self
                .tokens
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .unwrap_or_default();
            if token.is_cancelled() {
                // paused before it ever started
                if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
                    item.status = UploadState::Paused;
                }
                let _ = self.events.send(UploadEvent::Paused { item: id });
                continue;
            }

            debug!(item = %id, file = %item.filename, "starting upload");
            let mut uploader = ChunkUploader::new(
                self.api.clone(),
                self.store.clone(),
                self.policy,
                self.threshold,
                self.items.clone(),
                id,
                self.events.clone(),
                token,
            );
            uploader.run().await;

            if rx.is_empty() {
                let _ = self.events.send(UploadEvent::QueueIdle);
            }
        }
    }

    /// Pause an item by cancelling its in-flight work. The recovery record
    /// and the server session stay put.
    pub fn pause(&self, id: Uuid) {
        if let Some(token) = self.tokens.lock().unwrap().get(&id) {
            token.cancel();
        }
    }

    /// Resume a paused or failed item: clear the error, arm a fresh
    /// cancellation token and put it back on the queue. Returns false when
    /// the item is unknown or not resumable.
    pub fn resume(&self, id: Uuid) -> bool {
        {
            let mut items = self.items.lock().unwrap();
            let Some(item) = items.get_mut(&id) else {
                return false;
            };
            if !matches!(item.status, UploadState::Paused | UploadState::Error) {
                return false;
            }
            item.status = UploadState::Pending;
            item.error = None;
        }
        self.tokens
            .lock()
            .unwrap()
            .insert(id, CancellationToken::new());
        let _ = self.work_tx.send(id);
        true
    }

    /// Cancel an item outright: abort in-flight work, discard the server
    /// session and the recovery record, remove the item.
    pub async fn cancel(&self, id: Uuid) {
        if let Some(token) = self.tokens.lock().unwrap().remove(&id) {
            token.cancel();
        }
        let removed = self.items.lock().unwrap().remove(&id);
        self.order.lock().unwrap().retain(|other| *other != id);

        if let Some(item) = removed {
            if let Some(session_id) = item.session_id {
                if let Err(err) = self.api.cancel_upload(session_id).await {
                    warn!(session = %session_id, error = %err, "failed to cancel server session");
                }
                if let Err(err) = self.store.delete(session_id).await {
                    warn!(session = %session_id, error = %err, "failed to remove recovery record");
                }
            }
            let _ = self.events.send(UploadEvent::Cancelled { item: id });
        }
    }

    /// Snapshot of all items in enqueue order.
    pub fn items(&self) -> Vec<UploadItem> {
        let items = self.items.lock().unwrap();
        self.order
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| items.get(id).cloned())
            .collect()
    }

    /// Drop completed and failed entries from the active set.
    pub fn clear_finished(&self) {
        let survivors: Vec<Uuid> = {
            let mut items = self.items.lock().unwrap();
            items.retain(|_, item| {
                !matches!(item.status, UploadState::Completed | UploadState::Error)
            });
            items.keys().copied().collect()
        };
        self.order
            .lock()
            .unwrap()
            .retain(|id| survivors.contains(id));
        self.tokens
            .lock()
            .unwrap()
            .retain(|id, _| survivors.contains(id));
    }

    /// Scan the recovery store for transfers interrupted by a restart and
    /// put them back on the queue. Returns how many were re-enqueued.
    ///
    /// The server is reconciled first: completed or vanished sessions just
    /// drop their record, and the server's progress seeds the new item.
    pub async fn recover_pending(&self) -> Result<usize> {
        let records = self.store.list().await?;
        let mut resumed = 0usize;
        for record in records {
            match self.api.get_progress(record.session_id).await {
                Ok(session) if session.status == SessionStatus::Completed => {
                    let _ = self.store.delete(record.session_id).await;
                }
                Ok(session) if session.is_expired(chrono::Utc::now()) => {
                    // terminal on the server; nothing left to resume
                    let _ = self.store.delete(record.session_id).await;
                }
                Ok(session) => {
                    if !tokio::fs::try_exists(&record.source).await.unwrap_or(false) {
                        warn!(
                            source = %record.source.display(),
                            "source file for interrupted upload is gone; dropping record"
                        );
                        let _ = self.store.delete(record.session_id).await;
                        continue;
                    }
                    let mut item = UploadItem::new(
                        record.source.clone(),
                        record.filename.clone(),
                        record.path.clone(),
                        session.total_size as u64,
                    );
                    item.session_id = Some(record.session_id);
                    item.loaded = session.uploaded_size as u64;
                    item.progress = if session.total_size > 0 {
                        (session.uploaded_size as f64 / session.total_size as f64) * 100.0
                    } else {
                        0.0
                    };
                    let id = item.id;
                    info!(
                        session = %record.session_id,
                        file = %record.filename,
                        resumed_chunks = session.uploaded_chunks,
                        "resuming interrupted upload"
                    );
                    self.items.lock().unwrap().insert(id, item);
                    self.order.lock().unwrap().push(id);
                    self.tokens
                        .lock()
                        .unwrap()
                        .insert(id, CancellationToken::new());
                    let _ = self.events.send(UploadEvent::Queued { item: id });
                    let _ = self.work_tx.send(id);
                    resumed += 1;
                }
                Err(TransferError::NotFoundOrExpired) => {
                    // nothing left to resume; the caller can enqueue afresh
                    let _ = self.store.delete(record.session_id).await;
                }
                Err(err) => {
                    warn!(
                        session = %record.session_id,
                        error = %err,
                        "could not reconcile interrupted upload; keeping record"
                    );
                }
            }
        }
        Ok(resumed)
    }
}

fn join_dest(dest_dir: &str, filename: &str) -> String {
    let trimmed = dest_dir.trim_end_matches('/');
    if trimmed.is_empty() {
        filename.to_string()
    } else {
        format!("{}/{}", trimmed.trim_start_matches('/'), filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_paths_join_cleanly() {
        assert_eq!(join_dest("/", "a.txt"), "a.txt");
        assert_eq!(join_dest("", "a.txt"), "a.txt");
        assert_eq!(join_dest("/docs", "a.txt"), "docs/a.txt");
        assert_eq!(join_dest("docs/2025/", "a.txt"), "docs/2025/a.txt");
    }
}
