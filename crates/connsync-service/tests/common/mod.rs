// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for connsync-service tests.
//!
//! Provides a fixed-content source and service configuration fixtures.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use connsync_core::connector::ConfigurationMap;
use connsync_core::{
    ConnectorConfiguration, ConnectorRegistry, ConnectorStatus, Document, DocumentChange, Emitter,
    Extractor, MonitorConfig, SourceConnector,
};
use connsync_service::ServiceConfig;

pub const SERVICE_TYPE: &str = "static";

/// Source that always yields the same documents.
pub struct StaticSource {
    pub ids: Vec<&'static str>,
    /// Wait before each document.
    pub delay: Duration,
}

#[async_trait]
impl SourceConnector for StaticSource {
    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn configurable_fields(&self) -> ConfigurationMap {
        ConfigurationMap::new()
    }

    async fn health_check(&self, _connector: &ConnectorConfiguration) -> connsync_core::Result<()> {
        Ok(())
    }

    fn extractor(
        &self,
        _connector: &ConnectorConfiguration,
    ) -> connsync_core::Result<Box<dyn Extractor>> {
        Ok(Box::new(StaticExtractor {
            ids: self.ids.clone(),
            delay: self.delay,
        }))
    }
}

struct StaticExtractor {
    ids: Vec<&'static str>,
    delay: Duration,
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn extract(&self, emitter: &mut Emitter) -> connsync_core::Result<()> {
        for id in &self.ids {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let document = Document::new(*id).with_field("title", format!("Doc {}", id));
            emitter.emit(id, Ok(DocumentChange::upsert(document))).await?;
        }
        Ok(())
    }

    async fn deleted_ids(&self, _ids: &[String]) -> connsync_core::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub fn registry(ids: Vec<&'static str>) -> Arc<ConnectorRegistry> {
    slow_registry(ids, Duration::ZERO)
}

/// Registry whose source waits `delay` before each document.
pub fn slow_registry(ids: Vec<&'static str>, delay: Duration) -> Arc<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new();
    registry.register(Arc::new(StaticSource { ids, delay }));
    Arc::new(registry)
}

/// A connected, scheduled connector that has never synced.
///
/// The yearly schedule keeps it from syncing again during a test.
pub fn connector(id: &str, index: &str) -> ConnectorConfiguration {
    ConnectorConfiguration::new(id, index)
        .with_service_type(SERVICE_TYPE)
        .with_status(ConnectorStatus::Connected)
        .with_scheduling(true, Some("0 0 0 1 1 ?"))
}

/// Service configuration with short intervals for tests.
pub fn service_config(database_url: &str) -> ServiceConfig {
    ServiceConfig {
        database_url: database_url.to_string(),
        native_mode: true,
        connector_id: None,
        service_type: None,
        worker_hostname: "test-worker".to_string(),
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(1800),
        stuck_threshold: Duration::from_secs(30),
        cleanup_interval: Duration::from_millis(50),
        max_connection_attempts: 3,
        transient_retry_delay: Duration::from_millis(10),
        transient_backoff: Duration::from_millis(10),
        max_workers: 2,
        index_prefix: "search-".to_string(),
        monitor: MonitorConfig::default(),
    }
}

/// Poll `condition` until it holds, panicking after the timeout.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
