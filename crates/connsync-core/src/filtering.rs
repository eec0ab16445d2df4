// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Draft filter validation task.

use tracing::{error, info};

use crate::connector::{ConnectorConfiguration, ConnectorUpdate, FilterValidation};
use crate::error::{Result, abbreviate};
use crate::registry::ConnectorRegistry;
use crate::status::ConnectorStatus;
use crate::store::ConnectorStore;

/// Validate the connector's draft filter with its source and store the
/// result on the draft.
///
/// Returns `None` when there is no draft waiting for validation. A failing
/// validator puts the connector into `error` and is returned as `Err`.
pub async fn validate_draft(
    store: &dyn ConnectorStore,
    registry: &ConnectorRegistry,
    connector: &ConnectorConfiguration,
) -> Result<Option<FilterValidation>> {
    let Some(draft) = connector.draft_pending_validation() else {
        return Ok(None);
    };

    let source = registry.for_connector(connector)?;
    info!(connector_id = %connector.id, "Validating filtering for {}", connector.formatted());

    let validation = match source.validate_filtering(draft).await {
        Ok(validation) => validation,
        Err(e) => {
            error!(
                connector_id = %connector.id,
                error = %e,
                "Filter validation for {} failed",
                connector.formatted()
            );
            let update =
                ConnectorUpdate::status(ConnectorStatus::Error, Some(abbreviate(&e.to_string())));
            store.update_connector_fields(&connector.id, &update).await?;
            return Err(e);
        }
    };

    let mut filtering = connector.filtering.clone().unwrap_or_default();
    if let Some(draft) = filtering.draft.as_mut() {
        draft.validation = Some(validation.clone());
    }
    store
        .update_connector_fields(
            &connector.id,
            &ConnectorUpdate {
                filtering: Some(filtering),
                ..Default::default()
            },
        )
        .await?;

    info!(
        connector_id = %connector.id,
        state = %validation.state,
        errors = validation.errors.len(),
        "Filtering of {} is {}",
        connector.formatted(),
        validation.state
    );
    Ok(Some(validation))
}
