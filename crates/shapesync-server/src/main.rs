//! ShapeSync WebSocket relay server.
//!
//! Configuration comes from the environment (see [`ServerConfig`]); logging
//! is controlled with `RUST_LOG`.

use shapesync_core::FileStorage;
use shapesync_server::{app, spawn_autosave, AppState, ServerConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shapesync_server=info,tower_http=info".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Bad configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let state = match &config.data_dir {
        Some(dir) => match FileStorage::new(dir) {
            Ok(storage) => {
                info!("Persisting rooms to {}", dir.display());
                Arc::new(AppState::with_storage(Arc::new(storage)))
            }
            Err(e) => {
                error!("Cannot use data directory {}: {e}", dir.display());
                return ExitCode::FAILURE;
            }
        },
        None => Arc::new(AppState::new()),
    };
    if config.data_dir.is_some() {
        spawn_autosave(state.clone(), config.save_interval);
    }

    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.addr);
            return ExitCode::FAILURE;
        }
    };
    info!("ShapeSync relay listening on {}", config.addr);
    info!("WebSocket endpoint: ws://{}/ws", config.addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
    };
    if let Err(e) = axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    let saved = state.save_dirty().await;
    info!("Shut down, saved {saved} room(s)");
    ExitCode::SUCCESS
}
