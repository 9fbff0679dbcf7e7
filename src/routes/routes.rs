//! Defines routes for the upload API.
//!
//! ## Structure
//! - **Session endpoints** (chunked, resumable path)
//!   - `POST   /uploads` — create an upload session
//!   - `PATCH  /uploads/{id}?chunk={index}` — store one chunk (octet-stream body)
//!   - `GET    /uploads/{id}` — progress snapshot
//!   - `DELETE /uploads/{id}` — cancel session
//!
//! - **Single-shot endpoint** (files below the resumable threshold)
//!   - `POST   /resources/{*path}` — raw file body, written directly
//!
//! The wildcard `*path` allows nested destinations like `docs/2025/report.pdf`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        resource_handlers::upload_resource,
        upload_handlers::{cancel_upload, create_upload, get_upload, upload_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

// Chunk bodies (5 MiB by default) exceed axum's 2 MiB extractor limit.
const MAX_CHUNK_BODY: usize = 64 * 1024 * 1024;

/// Build and return the router for all upload routes.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // session endpoints
        .route("/uploads", post(create_upload))
        .route(
            "/uploads/{id}",
            get(get_upload).patch(upload_chunk).delete(cancel_upload),
        )
        // single-shot endpoint
        .route("/resources/{*path}", post(upload_resource))
        .layer(DefaultBodyLimit::max(MAX_CHUNK_BODY))
}
