//! Core data models for the upload service.
//!
//! These entities map to database tables via `sqlx::FromRow` and double as
//! the JSON wire format via `serde`.

pub mod session;
