// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! edgehost-node - Serverless Worker Host
//!
//! An HTTP server responsible for:
//! - Worker lifecycle (create, update, delete, flush)
//! - Sandbox configuration generation
//! - Runtime process supervision and log collection
//! - Master/agent reconciliation

use std::sync::Arc;
use tracing::{info, warn};

use edgehost_node::config::Config;
use edgehost_node::migrations;
use edgehost_node::runtime::NodeRuntime;
use edgehost_node::store::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edgehost_node=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        node = %config.node_name,
        master = config.master_endpoint.as_deref().unwrap_or("-"),
        worker_dir = %config.worker_dir.display(),
        "Starting edgehost node"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let addr = config.http_addr;

    // Start the runtime
    let runtime = NodeRuntime::builder()
        .config(config)
        .store(Arc::new(PgStore::new(pool)))
        .build()?
        .start()
        .await?;

    info!(addr = %addr, "Node ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("edgehost node shut down");

    Ok(())
}
