//! End-to-end upload flows: a real client engine driving a real server over
//! a loopback listener. A thin middleware layer records chunk traffic and
//! injects faults.

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use filedrop::client::api::UploadApi;
use filedrop::client::queue::UploadQueueCoordinator;
use filedrop::client::recovery::{FileRecoveryStore, MemoryRecoveryStore, RecoveryRecord, RecoveryStore};
use filedrop::client::retry::RetryPolicy;
use filedrop::client::uploader::{
    ChunkUploader, RESUMABLE_THRESHOLD, SharedItems, UploadEvent, UploadItem, UploadState,
};
use filedrop::models::session::SessionStatus;
use filedrop::run_migrations;
use filedrop::routes::routes::routes;
use filedrop::services::upload_service::UploadService;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

/// Per-test request interceptor: records every chunk index the server sees
/// and can fail the first N PATCH requests or slow each one down.
#[derive(Clone)]
struct RequestLog {
    patch_chunks: Arc<StdMutex<Vec<i64>>>,
    session_posts: Arc<AtomicI64>,
    fail_remaining: Arc<AtomicI64>,
    fail_status: u16,
    patch_delay: Duration,
}

impl RequestLog {
    fn new() -> Self {
        Self {
            patch_chunks: Arc::new(StdMutex::new(Vec::new())),
            session_posts: Arc::new(AtomicI64::new(0)),
            fail_remaining: Arc::new(AtomicI64::new(0)),
            fail_status: 500,
            patch_delay: Duration::ZERO,
        }
    }

    fn with_failures(status: u16, count: i64) -> Self {
        let log = Self::new();
        log.fail_remaining.store(count, Ordering::SeqCst);
        Self {
            fail_status: status,
            ..log
        }
    }

    fn with_patch_delay(delay: Duration) -> Self {
        Self {
            patch_delay: delay,
            ..Self::new()
        }
    }

    fn chunks(&self) -> Vec<i64> {
        self.patch_chunks.lock().unwrap().clone()
    }
}

async fn intercept(State(log): State<RequestLog>, req: Request, next: Next) -> Response {
    if req.method() == Method::POST && req.uri().path() == "/uploads" {
        log.session_posts.fetch_add(1, Ordering::SeqCst);
    }
    if req.method() == Method::PATCH {
        if let Some(query) = req.uri().query() {
            if let Some(value) = query.strip_prefix("chunk=") {
                log.patch_chunks
                    .lock()
                    .unwrap()
                    .push(value.parse().unwrap_or(-1));
            }
        }
        if log.fail_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            return StatusCode::from_u16(log.fail_status).unwrap().into_response();
        }
        if !log.patch_delay.is_zero() {
            tokio::time::sleep(log.patch_delay).await;
        }
    }
    next.run(req).await
}

struct TestServer {
    base_url: String,
    service: UploadService,
    _dirs: Vec<TempDir>,
}

async fn spawn_server(chunk_size: i64, log: RequestLog) -> TestServer {
    let root = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let dbdir = TempDir::new().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dbdir.path().join("sessions.db"))
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap(),
    );
    run_migrations(&db).await.unwrap();
    let service = UploadService::with_chunk_size(db, root.path(), staging.path(), chunk_size);

    let app = routes()
        .with_state(service.clone())
        .layer(middleware::from_fn_with_state(log, intercept));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        service,
        _dirs: vec![root, staging, dbdir],
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_source(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, pattern(len)).unwrap();
    path
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_unit: Duration::from_millis(10),
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> UploadEvent {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for upload event")
        .expect("event channel closed")
}

/// 12 MiB in 5 MiB chunks: three chunks, 2 MiB tail, completed after three
/// acknowledgments, assembled byte-identical.
#[tokio::test]
async fn chunked_upload_completes_end_to_end() {
    let log = RequestLog::new();
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store.clone(), fast_policy());
    let coordinator = Arc::new(coordinator);
    coordinator.enqueue(source.clone(), "/media").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    let mut session_id = None;
    loop {
        match next_event(&mut events).await {
            UploadEvent::Started { session, .. } => session_id = session,
            UploadEvent::Completed { dest_path, .. } => {
                assert_eq!(dest_path, "media/big.bin");
                break;
            }
            UploadEvent::Failed { error, .. } => panic!("upload failed: {error}"),
            _ => {}
        }
    }

    let session = server
        .service
        .get_session(session_id.expect("chunked upload must create a session"))
        .await
        .unwrap();
    assert_eq!(session.total_chunks, 3);
    assert_eq!(session.uploaded_chunks, 3);
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.etag.as_deref(),
        Some(format!("{:x}", md5::compute(pattern(12 * MIB))).as_str())
    );

    let written = std::fs::read(server.service.root_dir.join("media/big.bin")).unwrap();
    assert_eq!(written, pattern(12 * MIB));
    assert_eq!(log.chunks(), vec![0, 1, 2]);

    // recovery record is gone once the transfer completes
    assert!(store.list().await.unwrap().is_empty());
}

/// Files at or below the threshold bypass sessions entirely.
#[tokio::test]
async fn small_file_takes_single_shot_path() {
    let log = RequestLog::new();
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "notes.txt", 64 * 1024);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store, fast_policy());
    let coordinator = Arc::new(coordinator);
    coordinator.enqueue(source, "/docs").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    loop {
        match next_event(&mut events).await {
            UploadEvent::Started { session, .. } => assert_eq!(session, None),
            UploadEvent::Completed { .. } => break,
            UploadEvent::Failed { error, .. } => panic!("upload failed: {error}"),
            _ => {}
        }
    }

    let written = std::fs::read(server.service.root_dir.join("docs/notes.txt")).unwrap();
    assert_eq!(written, pattern(64 * 1024));
    assert_eq!(log.session_posts.load(Ordering::SeqCst), 0);
    assert!(log.chunks().is_empty());
}

/// Pausing aborts the in-flight chunk; resuming continues from the last
/// server-acknowledged index and never retransmits acknowledged chunks.
#[tokio::test]
async fn pause_and_resume_skips_acknowledged_chunks() {
    let log = RequestLog::with_patch_delay(Duration::from_millis(150));
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let item = UploadItem::new(
        source.clone(),
        "big.bin".into(),
        "media/big.bin".into(),
        (12 * MIB) as u64,
    );
    let id = item.id;
    let items: SharedItems = Arc::new(StdMutex::new(HashMap::from([(id, item)])));
    let (tx, mut events) = mpsc::unbounded_channel();

    let token = CancellationToken::new();
    let mut uploader = ChunkUploader::new(
        api.clone(),
        store.clone(),
        fast_policy(),
        RESUMABLE_THRESHOLD,
        items.clone(),
        id,
        tx.clone(),
        token.clone(),
    );
    let task = tokio::spawn(async move { uploader.run().await });

    // pause as soon as the first chunk is acknowledged
    loop {
        if let UploadEvent::Progress { .. } = next_event(&mut events).await {
            break;
        }
    }
    token.cancel();
    task.await.unwrap();

    let paused = items.lock().unwrap().get(&id).cloned().unwrap();
    assert_eq!(paused.status, UploadState::Paused);
    let session_id = paused.session_id.unwrap();
    let at_pause = server.service.get_session(session_id).await.unwrap();
    assert!(at_pause.uploaded_chunks >= 1);
    assert!(at_pause.uploaded_chunks < at_pause.total_chunks);
    // the recovery record survives a pause
    assert!(store.load(session_id).await.unwrap().is_some());
    let sent_before_resume = log.chunks().len();

    // resume with a fresh token; the loop reconciles against the server
    let mut uploader = ChunkUploader::new(
        api,
        store.clone(),
        fast_policy(),
        RESUMABLE_THRESHOLD,
        items.clone(),
        id,
        tx,
        CancellationToken::new(),
    );
    let task = tokio::spawn(async move { uploader.run().await });
    loop {
        match next_event(&mut events).await {
            UploadEvent::Completed { .. } => break,
            UploadEvent::Failed { error, .. } => panic!("resume failed: {error}"),
            _ => {}
        }
    }
    task.await.unwrap();

    let chunks = log.chunks();
    // chunk 0 was acknowledged before the pause and is never resent
    assert_eq!(chunks.iter().filter(|&&c| c == 0).count(), 1);
    // the resumed loop starts exactly at the server's acknowledged count
    assert_eq!(chunks[sent_before_resume], at_pause.uploaded_chunks);

    let done = server.service.get_session(session_id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    let written = std::fs::read(server.service.root_dir.join("media/big.bin")).unwrap();
    assert_eq!(written, pattern(12 * MIB));
    assert!(store.load(session_id).await.unwrap().is_none());
}

/// The coordinator's pause/resume controls drive the same state machine:
/// pause aborts the in-flight chunk, resume re-enters the loop and the
/// transfer finishes byte-identical.
#[tokio::test]
async fn coordinator_pause_and_resume_roundtrip() {
    let log = RequestLog::with_patch_delay(Duration::from_millis(150));
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store, fast_policy());
    let coordinator = Arc::new(coordinator);
    let id = coordinator.enqueue(source, "/media").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    loop {
        if let UploadEvent::Progress { .. } = next_event(&mut events).await {
            break;
        }
    }
    coordinator.pause(id);
    loop {
        if let UploadEvent::Paused { item } = next_event(&mut events).await {
            assert_eq!(item, id);
            break;
        }
    }
    let paused = coordinator
        .items()
        .into_iter()
        .find(|i| i.id == id)
        .unwrap();
    assert_eq!(paused.status, UploadState::Paused);
    assert!(paused.loaded > 0);

    assert!(coordinator.resume(id));
    loop {
        match next_event(&mut events).await {
            UploadEvent::Completed { item, .. } => {
                assert_eq!(item, id);
                break;
            }
            UploadEvent::Failed { error, .. } => panic!("resume failed: {error}"),
            _ => {}
        }
    }

    let written = std::fs::read(server.service.root_dir.join("media/big.bin")).unwrap();
    assert_eq!(written, pattern(12 * MIB));

    coordinator.clear_finished();
    assert!(coordinator.items().is_empty());
}

/// Two 503s followed by success: three attempts on the first chunk, then the
/// loop continues normally.
#[tokio::test]
async fn transient_errors_are_retried_with_backoff() {
    let log = RequestLog::with_failures(503, 2);
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store, fast_policy());
    let coordinator = Arc::new(coordinator);
    coordinator.enqueue(source, "/media").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    loop {
        match next_event(&mut events).await {
            UploadEvent::Completed { .. } => break,
            UploadEvent::Failed { error, .. } => panic!("upload failed: {error}"),
            _ => {}
        }
    }

    // chunk 0 three times (503, 503, 200), then chunks 1 and 2 once each
    assert_eq!(log.chunks(), vec![0, 0, 0, 1, 2]);
    let written = std::fs::read(server.service.root_dir.join("media/big.bin")).unwrap();
    assert_eq!(written, pattern(12 * MIB));
}

/// A 404 on a chunk is fatal: the loop halts with no retries and surfaces
/// the error.
#[tokio::test]
async fn gone_session_fails_without_retries() {
    let log = RequestLog::with_failures(404, i64::MAX);
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store, fast_policy());
    let coordinator = Arc::new(coordinator);
    let id = coordinator.enqueue(source, "/media").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    loop {
        match next_event(&mut events).await {
            UploadEvent::Failed { error, .. } => {
                assert!(error.contains("not found"));
                break;
            }
            UploadEvent::Completed { .. } => panic!("upload should have failed"),
            _ => {}
        }
    }

    // exactly one attempt; fatal errors consume no retry budget
    assert_eq!(log.chunks().len(), 1);
    let item = coordinator
        .items()
        .into_iter()
        .find(|i| i.id == id)
        .unwrap();
    assert_eq!(item.status, UploadState::Error);
    assert!(item.error.is_some());
}

/// The coordinator finishes one file before starting the next.
#[tokio::test]
async fn queue_processes_files_sequentially() {
    let log = RequestLog::new();
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let first = write_source(&scratch, "first.bin", 12 * MIB);
    let second = write_source(&scratch, "second.txt", 32 * 1024);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store, fast_policy());
    let coordinator = Arc::new(coordinator);
    let first_id = coordinator.enqueue(first, "/media").await.unwrap();
    let second_id = coordinator.enqueue(second, "/media").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    let mut sequence = Vec::new();
    let mut completed = 0;
    while completed < 2 {
        match next_event(&mut events).await {
            UploadEvent::Started { item, .. } => sequence.push(("started", item)),
            UploadEvent::Completed { item, .. } => {
                sequence.push(("completed", item));
                completed += 1;
            }
            UploadEvent::Failed { error, .. } => panic!("upload failed: {error}"),
            _ => {}
        }
    }

    assert_eq!(
        sequence,
        vec![
            ("started", first_id),
            ("completed", first_id),
            ("started", second_id),
            ("completed", second_id),
        ]
    );
    assert!(matches!(next_event(&mut events).await, UploadEvent::QueueIdle));
    assert!(server.service.root_dir.join("media/first.bin").exists());
    assert!(server.service.root_dir.join("media/second.txt").exists());
}

/// A recovery record left by a crashed process re-enqueues the transfer,
/// which then finishes without resending acknowledged chunks.
#[tokio::test]
async fn recover_pending_finishes_interrupted_upload() {
    let log = RequestLog::new();
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);
    let payload = pattern(12 * MIB);

    // simulate a process that died after chunk 0 was acknowledged
    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let session = api
        .create_session("big.bin", "media/big.bin", (12 * MIB) as u64)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    api.upload_chunk(
        session.id,
        0,
        bytes::Bytes::from(payload[..5 * MIB].to_vec()),
        &cancel,
    )
    .await
    .unwrap();
    let file_store = FileRecoveryStore::new(state_dir.path());
    file_store
        .save(&RecoveryRecord {
            session_id: session.id,
            filename: "big.bin".into(),
            path: "media/big.bin".into(),
            source: source.clone(),
            current_chunk: 1,
        })
        .await
        .unwrap();

    // a fresh coordinator picks the record up at startup
    let store: Arc<dyn RecoveryStore> = Arc::new(FileRecoveryStore::new(state_dir.path()));
    let (coordinator, mut events) =
        UploadQueueCoordinator::new(api, store.clone(), fast_policy());
    let coordinator = Arc::new(coordinator);
    assert_eq!(coordinator.recover_pending().await.unwrap(), 1);
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    loop {
        match next_event(&mut events).await {
            UploadEvent::Completed { .. } => break,
            UploadEvent::Failed { error, .. } => panic!("recovered upload failed: {error}"),
            _ => {}
        }
    }

    // each chunk was transmitted exactly once across both processes
    let mut chunks = log.chunks();
    chunks.sort_unstable();
    assert_eq!(chunks, vec![0, 1, 2]);
    let written = std::fs::read(server.service.root_dir.join("media/big.bin")).unwrap();
    assert_eq!(written, payload);
    assert!(store.list().await.unwrap().is_empty());
}

/// Cancelling an active upload discards the server session, the staging
/// data and the recovery record, and removes the item.
#[tokio::test]
async fn cancel_discards_session_and_record() {
    let log = RequestLog::with_patch_delay(Duration::from_millis(150));
    let server = spawn_server((5 * MIB) as i64, log.clone()).await;
    let scratch = TempDir::new().unwrap();
    let source = write_source(&scratch, "big.bin", 12 * MIB);

    let api = UploadApi::new(server.base_url.clone()).unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(MemoryRecoveryStore::new());
    let (coordinator, mut events) = UploadQueueCoordinator::new(api, store.clone(), fast_policy());
    let coordinator = Arc::new(coordinator);
    let id = coordinator.enqueue(source, "/media").await.unwrap();
    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    let session_id = loop {
        if let UploadEvent::Started { session, .. } = next_event(&mut events).await {
            break session.unwrap();
        }
    };
    coordinator.cancel(id).await;

    loop {
        if let UploadEvent::Cancelled { item } = next_event(&mut events).await {
            assert_eq!(item, id);
            break;
        }
    }

    assert!(
        server.service.get_session(session_id).await.is_err(),
        "cancelled session should be gone"
    );
    assert!(store.list().await.unwrap().is_empty());
    assert!(coordinator.items().is_empty());
}
