//! omsd - multi-host SSH operations daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oms_core::config::{self, ConfigSource, ServerConfig};
use oms_core::{ConfigError, SqliteStore};
use oms_server::playbook::StepRegistry;
use oms_server::{api, AppState};

#[derive(Parser)]
#[command(name = "omsd")]
#[command(about = "Multi-host SSH operations daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, source) = config::load_server_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.default_log_level().into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &source {
        ConfigSource::File(path) => tracing::info!("Loaded configuration from {}", path.display()),
        ConfigSource::Embedded => tracing::info!("Using embedded example configuration"),
    }

    let store = open_store(&config)?;
    for dir in [config.tmp_path(), config.upload_path(), config.plugin_path()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let steps = StepRegistry::discover(&config.plugin_path()).await;
    tracing::info!("Registered {} step types", steps.len());

    let cancel = CancellationToken::new();
    let state = Arc::new(AppState::new(config.clone(), store, steps, cancel.clone()));
    state.start().context("Failed to start background services")?;

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("{} listening on {}", config.app.name, addr);

    let shutdown = cancel.clone();
    axum::serve(listener, api::router(Arc::clone(&state)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    state.shutdown().await;
    tracing::info!("omsd shutdown complete");
    Ok(())
}

/// Only SQLite is supported as a backend
fn open_store(config: &ServerConfig) -> Result<Arc<SqliteStore>> {
    match config.db.driver.as_str() {
        "" | "sqlite" | "sqlite3" => {}
        other => return Err(ConfigError::UnsupportedDriver(other.to_string()).into()),
    }
    if let Some(dir) = config.sqlite_path().parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let path = config.sqlite_path();
    let store = SqliteStore::open(&path).with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}
