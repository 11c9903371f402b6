use crate::config::parse::load_config;
use crate::config::types::Config;
use crate::pipeline::{self, PipelineSettings};
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::traits::Storage;
use crate::web::run_server;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::traits::StorageError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("web server error: {0}")]
    WebServer(String),
}

/// Exit with a hint when no config file could be located.
pub fn require_config(config_path: Option<PathBuf>) -> PathBuf {
    match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/domino/config.yml");
            eprintln!("  /etc/domino/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'domino config init' to generate one.");
            std::process::exit(1);
        }
    }
}

/// Load the config and open the store it names, creating the schema.
pub async fn open_storage(config_path: &Path) -> Result<(Config, Arc<DuckDbStorage>), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    if let Some(parent) = config.storage.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::storage::traits::StorageError::Database(e.to_string()))?;
        }
    }

    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;
    Ok((config, storage))
}

pub async fn run(config_path: Option<PathBuf>, until_idle: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config(config_path);
    run_pipeline(&config_path, until_idle).await.map_err(|e| e.into())
}

async fn run_pipeline(config_path: &Path, until_idle: bool) -> Result<(), RunError> {
    let (config, storage) = open_storage(config_path).await?;

    let handle = pipeline::start(storage.clone(), PipelineSettings::from(&config));

    let web_handle = config.web.clone().map(|web_config| {
        info!("Starting web server on {}", web_config.listen);
        let web_storage: Arc<dyn Storage> = storage.clone();
        let shutdown_rx = handle.subscribe();
        tokio::spawn(async move {
            run_server(web_storage, web_config, shutdown_rx)
                .await
                .map_err(|e| RunError::WebServer(e.to_string()))
        })
    });

    if until_idle {
        info!("Running until no jobs are pending, press Ctrl+C to stop early");
        tokio::select! {
            result = wait_until_idle(&handle) => {
                result?;
                info!("All jobs committed");
            }
            _ = signal::ctrl_c() => info!("Shutdown signal received"),
        }
    } else {
        info!("Pipeline started, press Ctrl+C to shutdown");
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    }

    let report = handle.shutdown().await?;
    info!(
        published = report.dispatch.published,
        dropped = report.dispatch.dropped,
        processed = report.processed(),
        committed = report.sink.committed,
        empty = report.sink.empty,
        superseded = report.sink.superseded,
        discarded = report.sink.discarded,
        failed = report.sink.failed,
        "Pipeline shutdown complete"
    );

    if let Some(web_handle) = web_handle {
        match web_handle.await? {
            Ok(()) => info!("Web server stopped"),
            Err(e) => error!(error = %e, "Web server error"),
        }
    }

    Ok(())
}

async fn wait_until_idle(handle: &pipeline::PipelineHandle) -> Result<(), RunError> {
    while !handle.wait_idle(Duration::from_secs(5)).await? {}
    Ok(())
}
