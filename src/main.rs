//! tsm - tracked state machine service
//!
//! Serves machine definitions, instances and their audit history over TCP.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tsm_core::StateMachineService;
use tsm_server::{CommandHandler, Config, Server, ServerConfig, ServerInfo, CONFIG_ENV};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // File from TSM_CONFIG (if set), then env overrides
    let config = Config::load().map_err(|e| {
        tracing::error!("Failed to load config: {}", e);
        e
    })?;
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        tracing::info!("Loaded config from {}", path);
    }
    config.validate().map_err(|e| {
        tracing::error!("Invalid configuration: {}", e);
        e
    })?;

    let store_options = config.storage.store_options()?;

    tracing::info!("Starting tsm server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Store: {}", store_options.backend_name());
    tracing::info!("  Idle timeout: {}s", config.network.idle_timeout_secs);

    let store = tsm_storage::open_store(&store_options).await?;
    let service = Arc::new(StateMachineService::new(store));

    if !config.storage.definitions.is_empty() {
        let outcomes = tsm_storage::provision(&service, &config.storage.definitions).await?;
        let created = outcomes.iter().filter(|o| o.created).count();
        tracing::info!(
            "  Definitions: {} file(s), {} newly registered",
            outcomes.len(),
            created
        );
    }

    let info = ServerInfo {
        store: store_options.backend_name().to_string(),
        ..Default::default()
    };
    let server_config = ServerConfig::new(config.network.bind_addr)
        .with_idle_timeout(config.network.idle_timeout())
        .with_max_connections(config.network.max_connections);
    let server = Arc::new(Server::new(
        server_config,
        CommandHandler::with_info(service.clone(), info),
    ));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown
    server.run().await?;

    service.close().await;
    tracing::info!("Server stopped");
    Ok(())
}
