// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! connsync Service - Connector Sync Scheduler
//!
//! Polls connector records, dispatches sync, heartbeat, configuration and
//! filter validation tasks, and cleans up orphaned and stuck jobs.

use connsync_core::ConnectorRegistry;
use connsync_service::config::ServiceConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connsync=info,connsync_core=info,connsync_service=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = ServiceConfig::from_env()?;

    info!(
        native_mode = config.native_mode,
        connector_id = ?config.connector_id,
        poll_interval_secs = config.poll_interval.as_secs(),
        max_workers = config.max_workers,
        "Starting connsync service"
    );

    // Sources are registered by embedders; the bare binary only maintains jobs.
    let registry = ConnectorRegistry::new();

    connsync_service::serve(config, registry).await?;

    info!("connsync service shut down");
    Ok(())
}
