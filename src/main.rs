mod auth;
mod cache;
mod config;
mod directory;
mod git;
mod health;
mod http;
mod storage;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::auth::SharedSecret;
use crate::cache::RepoCache;
use crate::config::Config;
use crate::directory::{AppDirectory, ControllerDirectory};
use crate::storage::BlobStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitreceive", about = "Git smart HTTP receiver for app deploys")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on; overrides `http_listen` with `0.0.0.0:<port>`.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Password git clients must present, also used against the controller.
    pub secret: SharedSecret,
    pub directory: Arc<dyn AppDirectory>,
    pub repos: RepoCache,
    /// Streaming tasks that outlive their handler: output relay, snapshot
    /// upload and working-directory removal.
    pub tasks: TaskTracker,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    serve(listener, state, shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then wait for every streaming task.
///
/// Connections are idle once the last response body ends, but a push still
/// has its snapshot upload and directory removal to finish.
pub(crate) async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let tasks = state.tasks.clone();
    let app = http::handler::create_router(Arc::new(state));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    tasks.close();
    if !tasks.is_empty() {
        tracing::info!(pending = tasks.len(), "waiting for in-flight git exchanges");
    }
    tasks.wait().await;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.http_listen = format!("0.0.0.0:{port}");
    }
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting gitreceive");

    // ---- Shared secret ----
    let secret = SharedSecret::from_env(&config.auth.secret_env)?;

    // ---- Infrastructure clients ----
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("gitreceive/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;

    let directory: Arc<dyn AppDirectory> = Arc::new(ControllerDirectory::new(
        http_client.clone(),
        &config.controller.url,
        secret.clone(),
    ));

    if let Some(tmp_dir) = &config.repos.tmp_dir {
        tokio::fs::create_dir_all(tmp_dir)
            .await
            .with_context(|| format!("failed to create repo tmp dir: {}", tmp_dir.display()))?;
    }
    let repos = RepoCache::new(
        BlobStore::new(http_client, &config.blobstore.url),
        config.repos.tmp_dir.clone(),
    );
    tracing::info!(
        controller = %config.controller.url,
        blobstore = %config.blobstore.url,
        "backends configured"
    );

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        secret,
        directory,
        repos,
        tasks: TaskTracker::new(),
    };

    run_http_server(state).await?;

    tracing::info!("gitreceive shut down cleanly");
    Ok(())
}
