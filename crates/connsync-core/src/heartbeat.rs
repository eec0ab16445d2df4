// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector heartbeat task.
//!
//! Refreshes `last_seen`, bootstraps connectors that are still `created` and
//! health checks the ones that may sync.

use chrono::Utc;
use tracing::{info, warn};

use crate::configuration;
use crate::connector::ConnectorUpdate;
use crate::error::{Result, SyncError, abbreviate};
use crate::registry::ConnectorRegistry;
use crate::status::ConnectorStatus;
use crate::store::ConnectorStore;

/// Send one heartbeat for `connector_id`. Returns the connector status
/// after the heartbeat.
pub async fn send_heartbeat(
    store: &dyn ConnectorStore,
    registry: &ConnectorRegistry,
    connector_id: &str,
    service_type: Option<&str>,
) -> Result<ConnectorStatus> {
    let mut connector = store
        .get_connector(connector_id)
        .await?
        .ok_or_else(|| SyncError::ConnectorNotFound(connector_id.to_string()))?;

    let now = Utc::now().to_rfc3339();
    store
        .update_connector_fields(
            connector_id,
            &ConnectorUpdate {
                last_seen: Some(now.clone()),
                ..Default::default()
            },
        )
        .await?;
    connector.last_seen = Some(now);
    info!(connector_id = %connector_id, "*** Connector {} HEARTBEAT", connector_id);

    if connector.status == ConnectorStatus::Created {
        return configuration::bootstrap(store, registry, &connector, service_type).await;
    }

    if !connector.status.allows_sync() {
        return Ok(connector.status);
    }

    let source = match service_type.filter(|_| connector.needs_service_type()) {
        Some(service_type) => registry
            .get(service_type)
            .ok_or_else(|| SyncError::UnregisteredServiceType(service_type.to_string()))?,
        None => registry.for_connector(&connector)?,
    };
    let update = match source.health_check(&connector).await {
        Ok(()) => ConnectorUpdate::status(ConnectorStatus::Connected, None),
        Err(e) => {
            warn!(
                connector_id = %connector_id,
                error = %e,
                "Health check failed for {}",
                connector.formatted()
            );
            ConnectorUpdate::status(ConnectorStatus::Error, Some(abbreviate(&e.to_string())))
        }
    };
    store.update_connector_fields(connector_id, &update).await?;

    Ok(update.status.unwrap_or(connector.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConfigurationMap, ConnectorConfiguration};
    use crate::extractor::Extractor;
    use crate::registry::SourceConnector;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Pinged {
        healthy: bool,
    }

    #[async_trait]
    impl SourceConnector for Pinged {
        fn service_type(&self) -> &str {
            "pinged"
        }

        fn configurable_fields(&self) -> ConfigurationMap {
            ConfigurationMap::new()
        }

        async fn health_check(&self, _connector: &ConnectorConfiguration) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(SyncError::Source("connection refused".into()))
            }
        }

        fn extractor(&self, _connector: &ConnectorConfiguration) -> Result<Box<dyn Extractor>> {
            Err(SyncError::Other("unused".into()))
        }
    }

    fn registry(healthy: bool) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(Pinged { healthy }));
        registry
    }

    async fn stored(store: &MemoryStore, status: ConnectorStatus) {
        let connector = ConnectorConfiguration::new("c-1", "search-x")
            .with_service_type("pinged")
            .with_status(status);
        store.put_connector(&connector).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_marks_connected() {
        let store = MemoryStore::new();
        stored(&store, ConnectorStatus::Error).await;

        let status = send_heartbeat(&store, &registry(true), "c-1", None)
            .await
            .unwrap();

        assert_eq!(status, ConnectorStatus::Connected);
        let connector = store.get_connector("c-1").await.unwrap().unwrap();
        assert!(connector.last_seen_at().is_some());
        assert_eq!(connector.status, ConnectorStatus::Connected);
        assert!(connector.error.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_records_health_check_error() {
        let store = MemoryStore::new();
        stored(&store, ConnectorStatus::Connected).await;

        let status = send_heartbeat(&store, &registry(false), "c-1", None)
            .await
            .unwrap();

        assert_eq!(status, ConnectorStatus::Error);
        let connector = store.get_connector("c-1").await.unwrap().unwrap();
        assert_eq!(
            connector.error.as_deref(),
            Some("Source error: connection refused")
        );
    }

    #[tokio::test]
    async fn test_heartbeat_bootstraps_created_connector() {
        let store = MemoryStore::new();
        stored(&store, ConnectorStatus::Created).await;

        let status = send_heartbeat(&store, &registry(false), "c-1", None)
            .await
            .unwrap();

        // no configurable fields, so nothing is missing
        assert_eq!(status, ConnectorStatus::Configured);
    }

    #[tokio::test]
    async fn test_heartbeat_leaves_unconfigured_status() {
        let store = MemoryStore::new();
        stored(&store, ConnectorStatus::NeedsConfiguration).await;

        let status = send_heartbeat(&store, &registry(false), "c-1", None)
            .await
            .unwrap();

        assert_eq!(status, ConnectorStatus::NeedsConfiguration);
        let connector = store.get_connector("c-1").await.unwrap().unwrap();
        assert!(connector.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_missing_connector() {
        let store = MemoryStore::new();
        let err = send_heartbeat(&store, &registry(true), "gone", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectorNotFound(_)));
    }
}
