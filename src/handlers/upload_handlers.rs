//! HTTP handlers for the resumable upload session API.
//! Thin extractors over `UploadService`; chunk bodies arrive as raw bytes.

use crate::{errors::AppError, services::upload_service::UploadService};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

/// Request body for `POST /uploads`.
#[derive(Debug, Deserialize)]
pub struct CreateUploadReq {
    pub filename: String,
    pub path: String,
    pub size: i64,
}

/// Query params accepted by `PATCH /uploads/{id}`.
#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub chunk: Option<i64>,
}

/// `POST /uploads` — create an upload session.
pub async fn create_upload(
    State(service): State<UploadService>,
    Json(req): Json<CreateUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let session = service
        .create_session(&req.filename, &req.path, req.size)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `PATCH /uploads/{id}?chunk={index}` — store one chunk.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let index = query
        .chunk
        .ok_or_else(|| AppError::bad_request("missing `chunk` query parameter"))?;
    let session = service.upload_chunk(id, index, body).await?;
    Ok(Json(session))
}

/// `GET /uploads/{id}` — progress snapshot.
pub async fn get_upload(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = service.get_session(id).await?;
    Ok(Json(session))
}

/// `DELETE /uploads/{id}` — cancel and discard staging. Idempotent.
pub async fn cancel_upload(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    service.cancel_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
