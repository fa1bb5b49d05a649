// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::propagation::RetentionPolicy;

/// Rollover engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP server address for the trigger API
    pub http_addr: SocketAddr,
    /// How long a cron lease stays valid before another request may take it over
    pub cron_lease_ttl: Duration,
    /// Completed to-do retention windows
    pub retention: RetentionPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ROLLOVER_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `ROLLOVER_HTTP_PORT`: HTTP server port (default: 8080)
    /// - `ROLLOVER_CRON_LEASE_TTL_SECS`: Cron lease lifetime (default: 300)
    /// - `ROLLOVER_TODO_RETENTION_DAYS`: Completed to-do retention (default: 30)
    /// - `ROLLOVER_SUBSCRIBER_TODO_RETENTION_DAYS`: Retention for subscribers (default: 90)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("ROLLOVER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ROLLOVER_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("ROLLOVER_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("ROLLOVER_HTTP_PORT", "must be a valid port number")
            })?;

        let lease_ttl_secs: u64 = std::env::var("ROLLOVER_CRON_LEASE_TTL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Invalid(
                "ROLLOVER_CRON_LEASE_TTL_SECS",
                "must be a positive integer",
            ))?;

        let free_days = retention_days("ROLLOVER_TODO_RETENTION_DAYS", 30)?;
        let subscriber_days = retention_days("ROLLOVER_SUBSCRIBER_TODO_RETENTION_DAYS", 90)?;

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            cron_lease_ttl: Duration::from_secs(lease_ttl_secs),
            retention: RetentionPolicy {
                free_days,
                subscriber_days,
            },
        })
    }
}

fn retention_days(var: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|days| *days > 0)
            .ok_or(ConfigError::Invalid(var, "must be a positive number of days")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
