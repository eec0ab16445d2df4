// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! connsync Service - Connector Sync Scheduling
//!
//! This crate runs the [`connsync_core`] scheduler as a long-lived service:
//! events are dispatched to sync, heartbeat, configuration and filter
//! validation tasks, and a watchdog cleans up orphaned and stuck jobs.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐   (connector, task)   ┌──────────────────────────┐
//! │      Scheduler        │──────────────────────►│       Dispatcher         │
//! │  native or single     │                       │  sync pool (Semaphore)   │
//! └───────────────────────┘                       └──────────────────────────┘
//!           │                                                  │
//!           ▼                                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SQLite ConnectorStore                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           ▲
//!           │ orphaned / stuck jobs
//! ┌───────────────────────┐
//! │      JobCleanup       │
//! └───────────────────────┘
//! ```
//!
//! # Configuration
//!
//! See [`ServiceConfig::from_env`] for the `CONNSYNC_*` variables.

/// Service configuration loaded from environment variables.
pub mod config;

/// Service error types.
pub mod error;

/// Scheduler event dispatch with a bounded sync pool.
pub mod dispatcher;

/// Orphaned and stuck job watchdog.
pub mod job_cleanup;

/// Embeddable runtime tying the background tasks together.
pub mod runtime;

use std::sync::Arc;

use connsync_core::{ConnectorRegistry, SqliteStore};
use tracing::info;

pub use config::ServiceConfig;
pub use error::Error;
pub use runtime::ServiceRuntime;

/// Open the store, run the service until Ctrl-C, then shut down gracefully.
pub async fn serve(config: ServiceConfig, registry: ConnectorRegistry) -> error::Result<()> {
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    info!("Connected to database");

    let runtime = ServiceRuntime::start(&config, store, Arc::new(registry))?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await
}
