use anyhow::{Result, bail};
use axum::Router;
use clap::Parser;
use filedrop::client::api::UploadApi;
use filedrop::client::queue::UploadQueueCoordinator;
use filedrop::client::recovery::FileRecoveryStore;
use filedrop::client::retry::RetryPolicy;
use filedrop::client::uploader::UploadEvent;
use filedrop::config::{Cli, Command, ServeArgs, ServerConfig, UploadArgs};
use filedrop::{routes, run_migrations, services};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Upload(args) => upload(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cfg = ServerConfig::resolve(&args)?;
    tracing::info!("Starting filedrop with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.root_dir, &cfg.staging_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // Try opening manually before SQLx
    match fs::OpenOptions::new().create(true).write(true).open(db_path) {
        Ok(_) => tracing::debug!("Database file can be created/opened successfully."),
        Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // Schema statements are idempotent; apply them at every startup.
    run_migrations(&db).await?;
    if args.migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    let service = services::upload_service::UploadService::new(
        db.clone(),
        cfg.root_dir.clone(),
        cfg.staging_dir.clone(),
    );

    // --- Expired-session sweeper ---
    let sweeper = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Err(err) = sweeper.sweep_expired().await {
                tracing::warn!("expired-session sweep failed: {}", err);
            }
        }
    });

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn upload(args: UploadArgs) -> Result<()> {
    let api = UploadApi::new(args.server_url())?;
    let store = Arc::new(FileRecoveryStore::new(args.state_dir_path()));
    let (coordinator, mut events) =
        UploadQueueCoordinator::new(api, store, RetryPolicy::default());
    let coordinator = Arc::new(coordinator);

    let mut expected = coordinator.recover_pending().await?;
    for file in &args.files {
        coordinator.enqueue(file.clone(), &args.to).await?;
        expected += 1;
    }

    let worker = coordinator.clone();
    tokio::spawn(async move { worker.run().await });

    let mut completed = 0usize;
    let mut failed = 0usize;
    while completed + failed < expected {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            UploadEvent::Progress {
                item,
                progress,
                speed,
                ..
            } => {
                tracing::debug!(item = %item, progress, speed, "uploading");
            }
            UploadEvent::Completed { dest_path, .. } => {
                tracing::info!("uploaded {}", dest_path);
                completed += 1;
            }
            UploadEvent::Failed { error, .. } => {
                tracing::error!("upload failed: {}", error);
                failed += 1;
            }
            _ => {}
        }
    }

    if failed > 0 {
        bail!("{failed} of {expected} uploads failed");
    }
    tracing::info!("{completed} upload(s) finished");
    Ok(())
}
