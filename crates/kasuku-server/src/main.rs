//! Kasuku Chat Server - HTTP API for local chat model inference

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod state;

use config::ServerConfig;
use kasuku_core::engine::{DaemonFactory, LifecycleManager};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kasuku_server=debug,kasuku_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kasuku Chat Server");

    // Load configuration
    let config = ServerConfig::load()?;
    info!("Engine daemon socket: {:?}", config.engine.socket_path);

    // Wire the lifecycle manager to the engine daemon
    let factory = Arc::new(DaemonFactory::new(&config.engine.socket_path));
    let lifecycle = Arc::new(LifecycleManager::new(config.engine.clone(), factory));
    let state = AppState::new(lifecycle);

    // Build router
    let app = api::create_router(state);

    // Start server
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
