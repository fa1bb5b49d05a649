// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for rollover-core.
//!
//! [`RolloverRuntime`] runs the HTTP trigger surface inside an existing tokio
//! application instead of as the standalone binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rollover_core::runtime::RolloverRuntime;
//! use rollover_core::persistence::PostgresPersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(PostgresPersistence::connect("postgres://...", 10).await?);
//!
//!     let runtime = RolloverRuntime::builder()
//!         .persistence(persistence)
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cron_handlers::CronHandlerState;
use crate::guard::DEFAULT_LEASE_TTL;
use crate::persistence::Persistence;
use crate::propagation::RetentionPolicy;

/// Builder for creating a [`RolloverRuntime`].
pub struct RolloverRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    bind_addr: SocketAddr,
    lease_ttl: Duration,
    retention: RetentionPolicy,
}

impl std::fmt::Debug for RolloverRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloverRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("bind_addr", &self.bind_addr)
            .field("lease_ttl", &self.lease_ttl)
            .field("retention", &self.retention)
            .finish()
    }
}

impl Default for RolloverRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            lease_ttl: DEFAULT_LEASE_TTL,
            retention: RetentionPolicy::default(),
        }
    }
}

impl RolloverRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the HTTP bind address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the cron lease lifetime. Default: 5 minutes.
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the completed to-do retention windows.
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RolloverRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        Ok(RolloverRuntimeConfig {
            state: Arc::new(CronHandlerState::new(
                persistence,
                self.lease_ttl,
                self.retention,
            )),
            bind_addr: self.bind_addr,
        })
    }
}

/// Configuration for a [`RolloverRuntime`].
#[derive(Debug)]
pub struct RolloverRuntimeConfig {
    state: Arc<CronHandlerState>,
    bind_addr: SocketAddr,
}

impl RolloverRuntimeConfig {
    /// Bind the listener and spawn the HTTP server task.
    pub async fn start(self) -> Result<RolloverRuntime> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let app = crate::http::router(self.state.clone());
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while shutdown_rx.changed().await.is_ok() {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        info!(addr = %bind_addr, "RolloverRuntime started");

        Ok(RolloverRuntime {
            server_handle,
            shutdown_tx,
            state: self.state,
            bind_addr,
        })
    }
}

/// A running HTTP trigger surface embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct RolloverRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<CronHandlerState>,
    bind_addr: SocketAddr,
}

impl RolloverRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RolloverRuntimeBuilder {
        RolloverRuntimeBuilder::new()
    }

    /// Address the server is listening on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Shared handler state, for triggering rollovers in-process.
    pub fn state(&self) -> &Arc<CronHandlerState> {
        &self.state
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("RolloverRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("RolloverRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("RolloverRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("RolloverRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}
