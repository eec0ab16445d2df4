// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration bootstrap for freshly created connectors.

use tracing::{debug, info};

use crate::connector::{ConnectorConfiguration, ConnectorUpdate};
use crate::error::Result;
use crate::registry::ConnectorRegistry;
use crate::status::ConnectorStatus;
use crate::store::ConnectorStore;

/// Write the source's default configurable fields into a `created`
/// connector and move it to `configured` or `needs_configuration`.
///
/// `service_type` is written only when the connector has none. Connectors in
/// any other status are left alone. Returns the resulting status.
pub async fn bootstrap(
    store: &dyn ConnectorStore,
    registry: &ConnectorRegistry,
    connector: &ConnectorConfiguration,
    service_type: Option<&str>,
) -> Result<ConnectorStatus> {
    if connector.status != ConnectorStatus::Created {
        debug!(
            connector_id = %connector.id,
            status = %connector.status,
            "{} is already bootstrapped",
            connector.formatted()
        );
        return Ok(connector.status);
    }

    let mut effective = connector.clone();
    let mut update = ConnectorUpdate::default();
    if connector.needs_service_type() {
        if let Some(service_type) = service_type {
            effective.service_type = Some(service_type.to_string());
            update.service_type = Some(service_type.to_string());
        }
    }

    let source = registry.for_connector(&effective)?;
    let configuration = source.configurable_fields();
    let status = if configuration.values().all(|field| field.has_value()) {
        ConnectorStatus::Configured
    } else {
        ConnectorStatus::NeedsConfiguration
    };

    update.configuration = Some(configuration);
    update.status = Some(status);
    update.error = Some(None);
    store.update_connector_fields(&connector.id, &update).await?;

    info!(
        connector_id = %connector.id,
        service_type = source.service_type(),
        status = %status,
        "Changing connector status to {}",
        status
    );
    Ok(status)
}
