/*
 * Copyright (c) 2025 MirageDB contributors. All rights reserved.
 *
 * MirageDB - MongoDB-compatible database facade
 *
 * @file main.rs
 * @brief MirageDB server main entry point
 */

use miragedb::auth::{CredentialStore, ScramServer};
use miragedb::change_stream::ChangeStreamBroker;
use miragedb::commands::CommandProcessor;
use miragedb::cursor::CursorRegistry;
use miragedb::health::spawn_health_server;
use miragedb::logger::{init_logger, LogLevel};
use miragedb::memory_backend::MemoryBackend;
use miragedb::mirage_info;
use miragedb::router::QueryRouter;
use miragedb::server::MirageServer;
use miragedb::shutdown::{ShutdownConfig, ShutdownManager};
use miragedb::Config;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/miragedb.toml".to_string());
    let config = Config::load(&config_path).await?;

    let level: LogLevel = config
        .logging
        .level
        .parse()
        .unwrap_or(LogLevel::Info);
    init_logger(level);

    mirage_info!("MirageDB starting");
    mirage_info!("==========================================");
    mirage_info!("Configuration: {}", config_path);
    mirage_info!("Server Address: {}:{}", config.server.host, config.server.port);
    mirage_info!("TLS: {}", if config.tls.enabled { "ENABLED" } else { "DISABLED" });
    mirage_info!(
        "Authentication: {}",
        if config.authentication.enabled { "ENABLED" } else { "DISABLED" }
    );
    mirage_info!(
        "OLAP routing: {}",
        if config.router.olap_enabled { "ENABLED" } else { "DISABLED" }
    );
    mirage_info!("==========================================");

    // Shared infrastructure
    let registry = Arc::new(CursorRegistry::new(Duration::from_secs(
        config.cursors.idle_ttl_secs,
    )));
    let changes = Arc::new(ChangeStreamBroker::default());
    let oltp = Arc::new(MemoryBackend::new(registry.clone(), changes.clone()));

    // Credential store seeded from configuration
    let credentials = Arc::new(CredentialStore::new());
    for user in &config.authentication.users {
        credentials.add_user(&user.username, &user.db, &user.password)?;
    }
    let scram = Arc::new(ScramServer::new(credentials));

    let router = QueryRouter::new(config.router_config());
    let processor = Arc::new(CommandProcessor::new(
        oltp.clone(),
        None,
        router,
        scram,
        config.authentication.enabled,
    ));

    // Shutdown coordination
    let shutdown = Arc::new(ShutdownManager::new(ShutdownConfig::default()));
    shutdown.start_signal_handling().await;
    let token = shutdown.token();

    // Background services
    let _health = spawn_health_server(&config.health, &config.server.host, token.clone());
    let sweeper = registry.spawn_sweeper(
        Duration::from_secs(config.cursors.sweep_interval_secs),
        token.clone(),
    );

    // Wire server (blocks until shutdown)
    let server = MirageServer::new(config, processor, token);
    server.run().await?;

    shutdown
        .graceful_shutdown(&registry, || async { Ok(()) })
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let _ = sweeper.await;

    mirage_info!("MirageDB stopped");
    Ok(())
}
