//! Auco greeting indexer.
//!
//! Syncs `GreetingChanged` events of `YourContract` into SQLite and serves them over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Index a local devnet from genesis
//! auco-indexer --rpc-url http://127.0.0.1:5050
//!
//! # Follow sepolia from the current head
//! auco-indexer --network sepolia --starting-block latest --rpc-url https://...
//! ```

mod config;

use anyhow::{Context, Result};
use auco::{create_http_router, IndexerService};
use auco_greeting::{greeting_filter, greeting_routes, GreetingStorage};
use clap::Parser;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!(target: "auco::main", "Starting Auco greeting indexer");
    tracing::info!(target: "auco::main", "RPC URL: {}", config.rpc_url);
    tracing::info!(target: "auco::main", "Network: {}", config.network);
    tracing::info!(target: "auco::main", "Starting block: {}", config.starting_block);
    tracing::info!(target: "auco::main", "Database: {}", config.db_path);

    let indexer_config = config.indexer_config()?;
    let contract_address = config.parse_contract_address()?;

    let mut service = IndexerService::new(indexer_config).await;
    if let Some(e) = service.init_error() {
        anyhow::bail!("Indexer could not be initialized: {e}");
    }

    let store = service
        .store()
        .cloned()
        .context("Record store is not available")?;
    let storage = GreetingStorage::new(store).await?;
    service.register(greeting_filter(&config.network, contract_address, storage.clone())?)?;

    if !service.start().await {
        anyhow::bail!("Indexer failed to start, see logs for details");
    }

    let app = create_http_router(service.subscribe_status()).merge(greeting_routes(storage));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(target: "auco::main", "HTTP API listening on {}", addr);
    tracing::info!(target: "auco::main", "  - GET /health");
    tracing::info!(target: "auco::main", "  - GET /greetings");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(target: "auco::main", "Server error: {}", e);
    }

    tracing::info!(target: "auco::main", "HTTP server stopped, waiting for the sync loop...");

    let stopped = service.stop().await;
    let stats = service.status();
    service.shutdown().await;

    tracing::info!(target: "auco::main", "Final Statistics:");
    tracing::info!(target: "auco::main", "  Last committed block: {:?}", stats.cursor);
    tracing::info!(target: "auco::main", "  Blocks processed: {}", stats.blocks_processed);
    tracing::info!(target: "auco::main", "  Events handled: {}", stats.events_handled);
    tracing::info!(target: "auco::main", "  Decode errors: {}", stats.decode_errors);

    if stopped {
        tracing::info!(target: "auco::main", "Auco shutdown complete");
        Ok(())
    } else {
        anyhow::bail!("Sync loop did not stop cleanly")
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "auco::main", "Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!(target: "auco::main", "Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "auco::main", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!(target: "auco::main", "Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
