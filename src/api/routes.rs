//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::orchestrator::Orchestrator;

use super::results;
use super::types::*;
use super::verify;

/// Largest accepted multipart upload.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            config: orchestrator.config().clone(),
            orchestrator,
        }
    }
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.file.upload_dir).await?;
    tokio::fs::create_dir_all(&config.file.output_dir).await?;

    let orchestrator = Orchestrator::from_config(config.clone());
    let sweeper = orchestrator.start_sweeper();

    let state = Arc::new(AppState::new(orchestrator));
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    Ok(())
}

/// Build the router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/defaults", get(defaults))
        .route(
            "/api/validate_connection",
            post(verify::validate_connection),
        )
        .route(
            "/api/verify",
            post(verify::verify).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/verify/single", post(verify::verify_single))
        .route("/api/stream/:task_id", get(results::stream_task))
        // Unprefixed alias for clients that stream from /stream/<id>.
        .route("/stream/:task_id", get(results::stream_task))
        .route("/api/tasks/:task_id", get(results::get_task))
        .route("/api/result/:task_id", get(results::get_result))
        .route("/api/results/:task_id", get(results::list_results))
        .route("/api/preview/:task_id/*file", get(results::preview_output))
        .route("/outputs/:task_id/*file", get(results::serve_output))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub(super) async fn defaults(State(state): State<Arc<AppState>>) -> Json<DefaultsResponse> {
    let config = &state.config;
    Json(DefaultsResponse {
        api_url: config.api.base_url.clone(),
        has_api_key: config
            .api
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty()),
        model: config.workspace.model.clone(),
        similarity_threshold: config.analyzer.similarity_threshold,
    })
}
