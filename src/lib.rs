//! filedrop — self-hosted file upload service with resumable chunked uploads.
//!
//! The server half (`services`, `handlers`, `routes`) tracks each large
//! transfer as a durable session, accepts chunks idempotently and assembles
//! the file once every chunk has arrived. The client half (`client`) drives
//! transfers chunk-by-chunk with bounded retries, live speed/ETA estimates
//! and crash recovery, so an upload survives pauses, network failures and
//! process restarts without restarting from byte zero.

use anyhow::Result;
use sqlx::SqlitePool;

pub mod chunker;
pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

/// Apply the embedded schema to a SQLite database. Statements are idempotent,
/// so running this at every startup is safe.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let sql = include_str!("../migrations/0001_init.sql");
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("running {} migration statements", statements.len());
    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}
