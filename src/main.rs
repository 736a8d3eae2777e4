//! qa-verifier - HTTP Server Entry Point
//!
//! Starts the HTTP server that accepts verification tasks and streams their
//! progress.

use qa_verifier::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qa_verifier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: api={}, model={}, threshold={}",
        config.api.base_url, config.workspace.model, config.analyzer.similarity_threshold
    );
    if config.api.api_key.is_none() {
        tracing::warn!("No API key configured; tasks must supply one as an override");
    }

    api::serve(config).await
}
