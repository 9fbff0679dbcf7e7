//! Typed HTTP client for the upload API.
//!
//! Every call maps error responses into the [`TransferError`] taxonomy so
//! the retry layer can tell transient failures from fatal ones.

use crate::models::session::UploadSession;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use uuid::Uuid;

/// Failure classification for a single transfer operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The server rejected the request shape. Fatal, no retry.
    #[error("{0}")]
    Validation(String),
    /// The session vanished or outlived its expiry. Fatal; progress under it
    /// is lost and a fresh session is needed.
    #[error("upload session not found or expired")]
    NotFoundOrExpired,
    /// 5xx or 429 — worth retrying with backoff.
    #[error("server error (status {0})")]
    Transient(u16),
    /// Connection-level failure — worth retrying with backoff.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The caller paused or cancelled the transfer. Not an error.
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Network(_))
    }
}

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    filename: &'a str,
    path: &'a str,
    size: u64,
}

/// Client for the upload endpoints of a filedrop server.
#[derive(Clone)]
pub struct UploadApi {
    client: Client,
    base_url: String,
}

impl UploadApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let base_url = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into the matching `TransferError`.
    async fn error_from_response(response: Response) -> TransferError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return TransferError::NotFoundOrExpired;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return TransferError::Transient(status.as_u16());
        }
        let body = response.text().await.unwrap_or_default();
        // the server answers errors as {"error": "..."}; fall back to the raw body
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        if message.is_empty() {
            TransferError::Validation(format!("request failed with status {}", status))
        } else {
            TransferError::Validation(message)
        }
    }

    async fn session_from(response: Response) -> Result<UploadSession, TransferError> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `POST /uploads` — create a session for a chunked transfer.
    pub async fn create_session(
        &self,
        filename: &str,
        path: &str,
        size: u64,
    ) -> Result<UploadSession, TransferError> {
        let response = self
            .client
            .post(self.url("/uploads"))
            .json(&CreateSessionBody {
                filename,
                path,
                size,
            })
            .send()
            .await?;
        Self::session_from(response).await
    }

    /// `PATCH /uploads/{id}?chunk={index}` — send one chunk.
    ///
    /// A raised cancellation token aborts the in-flight request and returns
    /// `Cancelled`.
    pub async fn upload_chunk(
        &self,
        session_id: Uuid,
        index: u64,
        bytes: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, TransferError> {
        let request = self
            .client
            .patch(self.url(&format!("/uploads/{}", session_id)))
            .query(&[("chunk", index)])
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            res = request.send() => res?,
        };
        Self::session_from(response).await
    }

    /// `GET /uploads/{id}` — authoritative progress snapshot.
    pub async fn get_progress(&self, session_id: Uuid) -> Result<UploadSession, TransferError> {
        let response = self
            .client
            .get(self.url(&format!("/uploads/{}", session_id)))
            .send()
            .await?;
        Self::session_from(response).await
    }

    /// `DELETE /uploads/{id}` — cancel a session.
    pub async fn cancel_upload(&self, session_id: Uuid) -> Result<(), TransferError> {
        let response = self
            .client
            .delete(self.url(&format!("/uploads/{}", session_id)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    /// `POST /resources/{path}` — single-shot upload of a whole file.
    ///
    /// The body streams from disk; `on_progress` fires with the cumulative
    /// byte count as the transport consumes the stream.
    pub async fn upload_resource<F>(
        &self,
        path: &str,
        file: File,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<(), TransferError>
    where
        F: FnMut(u64) + Send + 'static,
    {
        let mut loaded = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                loaded += bytes.len() as u64;
                on_progress(loaded);
            }
            chunk
        });

        let request = self
            .client
            .post(self.url(&format!("/resources/{}", encode_path(path))))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream));
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            res = request.send() => res?,
        };
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }
}

/// Percent-encode a destination path while keeping `/` separators intact.
fn encode_path(path: &str) -> String {
    urlencoding::encode(path.trim_start_matches('/')).replace("%2F", "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransferError::Transient(503).is_retryable());
        assert!(TransferError::Transient(429).is_retryable());
        assert!(!TransferError::NotFoundOrExpired.is_retryable());
        assert!(!TransferError::Validation("bad".into()).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
    }

    #[test]
    fn path_encoding_keeps_separators() {
        assert_eq!(encode_path("/docs/report.pdf"), "docs/report.pdf");
        assert_eq!(encode_path("docs/my file.txt"), "docs/my%20file.txt");
    }
}
