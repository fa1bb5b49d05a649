// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollover service.
//!
//! Serves the daily rollover trigger over HTTP, backed by PostgreSQL or SQLite
//! depending on `ROLLOVER_DATABASE_URL`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use rollover_core::config::Config;
use rollover_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use rollover_core::runtime::RolloverRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rollover_core=info".parse()?),
        )
        .init();

    info!("Starting rollover service");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        lease_ttl_secs = config.cron_lease_ttl.as_secs(),
        todo_retention_days = config.retention.free_days,
        subscriber_todo_retention_days = config.retention.subscriber_days,
        "Configuration loaded"
    );

    info!("Connecting to database and running migrations...");
    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        Arc::new(SqlitePersistence::connect(&config.database_url).await?)
    } else {
        Arc::new(PostgresPersistence::connect(&config.database_url, 10).await?)
    };

    if !persistence.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database ready");

    let runtime = RolloverRuntime::builder()
        .persistence(persistence)
        .bind_addr(config.http_addr)
        .lease_ttl(config.cron_lease_ttl)
        .retention(config.retention)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Rollover service listening");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
