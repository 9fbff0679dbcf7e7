//! Per-file transfer state machine.
//!
//! Drives one file chunk-by-chunk through the session API (or in a single
//! streamed request below the resumable threshold), updating the shared
//! upload item and emitting progress events as it goes. One network
//! operation is in flight at a time; chunk `i+1` is never sent before chunk
//! `i` is acknowledged.

use super::api::{TransferError, UploadApi};
use super::recovery::{RecoveryRecord, RecoveryStore};
use super::retry::{RetryPolicy, with_retry};
use super::speed::SpeedEstimator;
use crate::chunker::ChunkPlan;
use crate::models::session::{SessionStatus, UploadSession};
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::HashMap,
    io::SeekFrom,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Files at or below this size skip session bookkeeping and go up in one
/// streamed request.
pub const RESUMABLE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Caller-visible state of one upload item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Uploading,
    Paused,
    Completed,
    Error,
}

/// One in-flight file transfer, as seen by the caller.
#[derive(Clone, Debug)]
pub struct UploadItem {
    /// Client-side correlation key; not the session id.
    pub id: Uuid,
    pub filename: String,
    /// Local file being uploaded.
    pub source: PathBuf,
    /// Destination path on the server, filename included.
    pub dest_path: String,
    pub size: u64,
    pub status: UploadState,
    /// 0–100.
    pub progress: f64,
    /// Bytes acknowledged so far.
    pub loaded: u64,
    /// Bytes per second over the recent window.
    pub speed: f64,
    /// Estimated seconds remaining; `None` while indeterminate.
    pub eta: Option<f64>,
    pub error: Option<String>,
    /// Set once a chunked session exists for this item.
    pub session_id: Option<Uuid>,
}

impl UploadItem {
    pub fn new(source: PathBuf, filename: String, dest_path: String, size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename,
            source,
            dest_path,
            size,
            status: UploadState::Pending,
            progress: 0.0,
            loaded: 0,
            speed: 0.0,
            eta: None,
            error: None,
            session_id: None,
        }
    }
}

/// Progress and lifecycle notifications, consumed by a single subscriber.
#[derive(Clone, Debug)]
pub enum UploadEvent {
    Queued {
        item: Uuid,
    },
    Started {
        item: Uuid,
        session: Option<Uuid>,
    },
    Progress {
        item: Uuid,
        loaded: u64,
        total: u64,
        progress: f64,
        speed: f64,
        eta: Option<f64>,
    },
    Paused {
        item: Uuid,
    },
    Completed {
        item: Uuid,
        dest_path: String,
    },
    Failed {
        item: Uuid,
        error: String,
    },
    Cancelled {
        item: Uuid,
    },
    /// The queue has no more work; a good moment for collaborators to
    /// refresh listings or raise notifications.
    QueueIdle,
}

/// Upload items shared between the coordinator, the active uploader and the
/// caller's snapshots.
pub type SharedItems = Arc<Mutex<HashMap<Uuid, UploadItem>>>;

pub struct ChunkUploader {
    api: UploadApi,
    store: Arc<dyn RecoveryStore>,
    policy: RetryPolicy,
    threshold: u64,
    items: SharedItems,
    item_id: Uuid,
    events: mpsc::UnboundedSender<UploadEvent>,
    cancel: CancellationToken,
    estimator: SpeedEstimator,
}

impl ChunkUploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: UploadApi,
        store: Arc<dyn RecoveryStore>,
        policy: RetryPolicy,
        threshold: u64,
        items: SharedItems,
        item_id: Uuid,
        events: mpsc::UnboundedSender<UploadEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            store,
            policy,
            threshold,
            items,
            item_id,
            events,
            cancel,
            estimator: SpeedEstimator::new(),
        }
    }

    fn update_item(&self, f: impl FnOnce(&mut UploadItem)) {
        if let Some(item) = self.items.lock().unwrap().get_mut(&self.item_id) {
            f(item);
        }
    }

    fn snapshot(&self) -> Option<UploadItem> {
        self.items.lock().unwrap().get(&self.item_id).cloned()
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events.send(event);
    }

    /// Run the transfer to a terminal state: `Completed`, `Paused`
    /// (cancellation token raised) or `Error` (fatal failure or exhausted
    /// retries). Safe to call again after a pause or failure; the loop
    /// reconciles against the server and continues from the last
    /// acknowledged chunk.
    pub async fn run(&mut self) {
        let Some(item) = self.snapshot() else {
            // removed before the worker got to it
            return;
        };
        self.update_item(|i| {
            i.status = UploadState::Uploading;
            i.error = None;
        });

        let outcome = if item.size <= self.threshold {
            self.run_single_shot(&item).await
        } else {
            self.run_chunked(&item).await
        };

        match outcome {
            Ok(()) => {
                self.update_item(|i| {
                    i.status = UploadState::Completed;
                    i.progress = 100.0;
                    i.loaded = i.size;
                    i.speed = 0.0;
                    i.eta = None;
                });
                if self.snapshot().is_some() {
                    self.emit(UploadEvent::Completed {
                        item: item.id,
                        dest_path: item.dest_path.clone(),
                    });
                }
            }
            Err(TransferError::Cancelled) => {
                self.update_item(|i| {
                    i.status = UploadState::Paused;
                    i.speed = 0.0;
                    i.eta = None;
                    if i.session_id.is_none() {
                        // single-shot transfers have nothing to resume from
                        i.progress = 0.0;
                        i.loaded = 0;
                    }
                });
                if self.snapshot().is_some() {
                    self.emit(UploadEvent::Paused { item: item.id });
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.update_item(|i| {
                    i.status = UploadState::Error;
                    i.error = Some(message.clone());
                    i.speed = 0.0;
                    i.eta = None;
                });
                if self.snapshot().is_some() {
                    self.emit(UploadEvent::Failed {
                        item: item.id,
                        error: message,
                    });
                }
            }
        }
    }

    /// Chunked path: session + recovery record + sequential chunk loop.
    async fn run_chunked(&mut self, item: &UploadItem) -> Result<(), TransferError> {
        let session = self.acquire_session(item).await?;
        let session_id = session.id;
        self.update_item(|i| i.session_id = Some(session_id));
        self.emit(UploadEvent::Started {
            item: item.id,
            session: Some(session_id),
        });

        let plan = ChunkPlan::new(session.total_size as u64, session.chunk_size as u64);
        let total_chunks = plan.total_chunks();

        // The server's distinct-chunk count is authoritative. With a strictly
        // sequential writer it is also the next index to send.
        let mut index = session.uploaded_chunks as u64;
        if session.status == SessionStatus::Completed || index >= total_chunks {
            self.drop_record(session_id).await;
            return Ok(());
        }
        debug!(
            item = %item.id,
            session = %session_id,
            start_chunk = index,
            total_chunks,
            "entering chunk loop"
        );

        let mut file = File::open(&item.source).await?;
        let resumed_loaded = plan.bounds(index).map(|r| r.start).unwrap_or(item.size);
        self.update_item(|i| {
            i.loaded = resumed_loaded;
            i.progress = percent(resumed_loaded, item.size);
        });

        while index < total_chunks {
            let Some(range) = plan.bounds(index) else {
                break;
            };
            let len = (range.end - range.start) as usize;
            let mut buf = vec![0u8; len];
            file.seek(SeekFrom::Start(range.start)).await?;
            file.read_exact(&mut buf).await?;
            let bytes = Bytes::from(buf);

            let started = Instant::now();
            let updated = {
                let api = self.api.clone();
                let cancel = self.cancel.clone();
                let bytes = bytes.clone();
                with_retry(self.policy, &self.cancel, move || {
                    let api = api.clone();
                    let cancel = cancel.clone();
                    let bytes = bytes.clone();
                    async move { api.upload_chunk(session_id, index, bytes, &cancel).await }
                })
                .await?
            };

            self.estimator.record(len as u64, started.elapsed());
            index += 1;

            let record = RecoveryRecord {
                session_id,
                filename: item.filename.clone(),
                path: item.dest_path.clone(),
                source: item.source.clone(),
                current_chunk: index,
            };
            if let Err(err) = self.store.save(&record).await {
                warn!(session = %session_id, error = %err, "failed to persist recovery record");
            }

            let loaded = updated.uploaded_size as u64;
            let speed = self.estimator.speed();
            let eta = self.estimator.eta(item.size.saturating_sub(loaded));
            let progress = percent(loaded, item.size);
            self.update_item(|i| {
                i.loaded = loaded;
                i.progress = progress;
                i.speed = speed;
                i.eta = eta;
            });
            self.emit(UploadEvent::Progress {
                item: item.id,
                loaded,
                total: item.size,
                progress,
                speed,
                eta,
            });

            if updated.status == SessionStatus::Completed {
                break;
            }
        }

        self.drop_record(session_id).await;
        Ok(())
    }

    /// Reuse the item's existing session when the server still knows it,
    /// otherwise start fresh from chunk 0.
    async fn acquire_session(&self, item: &UploadItem) -> Result<UploadSession, TransferError> {
        if let Some(existing) = item.session_id {
            match self.api.get_progress(existing).await {
                Ok(session)
                    if session.status != SessionStatus::Failed
                        && !session.is_expired(Utc::now()) =>
                {
                    return Ok(session);
                }
                Ok(_) => {
                    debug!(session = %existing, "server session failed or expired; starting over");
                }
                Err(TransferError::NotFoundOrExpired) => {
                    debug!(session = %existing, "server session gone; starting over");
                }
                Err(err) => return Err(err),
            }
            self.drop_record(existing).await;
        }

        let session = self
            .api
            .create_session(&item.filename, &item.dest_path, item.size)
            .await?;
        let record = RecoveryRecord {
            session_id: session.id,
            filename: item.filename.clone(),
            path: item.dest_path.clone(),
            source: item.source.clone(),
            current_chunk: 0,
        };
        if let Err(err) = self.store.save(&record).await {
            warn!(session = %session.id, error = %err, "failed to persist recovery record");
        }
        Ok(session)
    }

    async fn drop_record(&self, session_id: Uuid) {
        if let Err(err) = self.store.delete(session_id).await {
            warn!(session = %session_id, error = %err, "failed to remove recovery record");
        }
    }

    /// Single-shot path for small files: one streamed request, progress from
    /// the transport as the body is consumed.
    async fn run_single_shot(&mut self, item: &UploadItem) -> Result<(), TransferError> {
        self.emit(UploadEvent::Started {
            item: item.id,
            session: None,
        });

        let file = File::open(&item.source).await?;
        let total = item.size;
        let item_id = item.id;
        let items = self.items.clone();
        let events = self.events.clone();
        let mut estimator = SpeedEstimator::new();
        let mut last_mark = Instant::now();
        let mut last_loaded = 0u64;

        let on_progress = move |loaded: u64| {
            let now = Instant::now();
            estimator.record(loaded - last_loaded, now - last_mark);
            last_mark = now;
            last_loaded = loaded;
            let speed = estimator.speed();
            let eta = estimator.eta(total.saturating_sub(loaded));
            let progress = percent(loaded, total);
            if let Some(i) = items.lock().unwrap().get_mut(&item_id) {
                i.loaded = loaded;
                i.progress = progress;
                i.speed = speed;
                i.eta = eta;
            }
            let _ = events.send(UploadEvent::Progress {
                item: item_id,
                loaded,
                total,
                progress,
                speed,
                eta,
            });
        };

        self.api
            .upload_resource(&item.dest_path, file, &self.cancel, on_progress)
            .await
    }
}

fn percent(loaded: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (loaded as f64 / total as f64) * 100.0
    }
}
