// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use anyhow::Context;
use axum::{Router, routing::get};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::data_source_manager::DataSourceManager;
use crate::infrastructure::config::load_config;
use crate::infrastructure::home_assistant::HomeAssistantClient;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    get_entity, health_check, list_entities, list_sources, source_samples, stream_changes,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config_path =
        std::env::var("ENTITY_STREAM_CONFIG").unwrap_or_else(|_| "config/entity_stream".to_string());
    let config = load_config(&config_path)?;

    // Host platform adapter (infrastructure layer)
    let platform = Arc::new(HomeAssistantClient::new(config.host.base_url, config.host.token));

    // Data sources (application layer)
    let manager = Arc::new(DataSourceManager::new(platform));
    let started = manager.initialize_from_config(&config.sources).await;
    if started < config.sources.len() {
        tracing::warn!(
            "{} of {} data sources are not live; serving buffered data for them",
            config.sources.len() - started,
            config.sources.len()
        );
    }

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/entities", get(list_entities))
        .route("/entities/:id", get(get_entity))
        .route("/sources", get(list_sources))
        .route("/sources/:name/samples", get(source_samples))
        .route("/changes", get(stream_changes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid server.bind address: {}", config.server.bind))?;
    tracing::info!("Starting entity-stream service on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.destroy();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
