use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;
use crate::storage::Storage;

use super::api::{health_check, list_rollups, list_tags, pending_jobs, AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/jobs/pending", get(pending_jobs))
        .route("/api/tags", get(list_tags))
        .route("/api/rollups", get(list_rollups))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the status API until the shutdown signal flips to `true`.
pub async fn run_server(
    storage: Arc<dyn Storage>,
    web_config: WebConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(AppState {
        storage,
        stuck_after: web_config.stuck_after,
    });

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await?;

    Ok(())
}
