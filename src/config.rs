use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::env;
use std::path::PathBuf;

/// Centralized server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root_dir: String,
    pub staging_dir: String,
    pub database_url: String,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Self-hosted file upload service with resumable chunked uploads")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload API server
    Serve(ServeArgs),
    /// Upload files to a running server
    Upload(UploadArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Host to bind to (overrides FILEDROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILEDROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory completed files are written under (overrides FILEDROP_ROOT_DIR)
    #[arg(long)]
    pub root_dir: Option<String>,

    /// Directory for in-flight chunk staging (overrides FILEDROP_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides FILEDROP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Destination directory on the server
    #[arg(long, default_value = "/")]
    pub to: String,

    /// Server base URL (overrides FILEDROP_SERVER)
    #[arg(long)]
    pub server: Option<String>,

    /// Directory for recovery records (overrides FILEDROP_STATE_DIR)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Merge CLI arguments over environment variables into a ServerConfig.
    pub fn resolve(args: &ServeArgs) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("FILEDROP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("FILEDROP_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing FILEDROP_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 8080,
            Err(err) => return Err(err).context("reading FILEDROP_PORT"),
        };
        let env_root = env::var("FILEDROP_ROOT_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_staging =
            env::var("FILEDROP_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_db = env::var("FILEDROP_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/filedrop.db".into());

        // --- Merge ---
        Ok(Self {
            host: args.host.clone().unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            root_dir: args.root_dir.clone().unwrap_or(env_root),
            staging_dir: args.staging_dir.clone().unwrap_or(env_staging),
            database_url: args.database_url.clone().unwrap_or(env_db),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl UploadArgs {
    pub fn server_url(&self) -> String {
        self.server
            .clone()
            .or_else(|| env::var("FILEDROP_SERVER").ok())
            .unwrap_or_else(|| "http://localhost:8080".into())
    }

    pub fn state_dir_path(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| env::var("FILEDROP_STATE_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./.filedrop"))
    }
}
