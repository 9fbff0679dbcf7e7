//! Single-shot upload handler.
//! Files below the resumable threshold are posted in one request; the body
//! streams to disk without buffering in memory.

use crate::{errors::AppError, services::upload_service::UploadService};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::json;
use std::io;

/// `POST /resources/{*path}` — write the raw body to `path` under the root.
pub async fn upload_resource(
    State(service): State<UploadService>,
    Path(path): Path<String>,
    body: Body,
) -> Result<Response, AppError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let (size, etag) = service.write_resource(&path, stream).await?;

    let mut response = (
        StatusCode::CREATED,
        Json(json!({ "path": path, "size": size })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}
