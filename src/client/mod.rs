//! Client engine for resumable uploads.
//!
//! `UploadQueueCoordinator` sequences files, `ChunkUploader` drives each one
//! chunk-by-chunk under `RetryPolicy`, `SpeedEstimator` turns per-chunk
//! timings into throughput/ETA, and `RecoveryStore` keeps the durable resume
//! pointers that survive a process restart.

pub mod api;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod speed;
pub mod uploader;
