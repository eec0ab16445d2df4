// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector configuration records and partial updates.
//!
//! The store owns the full record; the engine only reads it and writes the
//! fields it is responsible for through [`ConnectorUpdate`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{ConnectorStatus, JobStatus, ValidationState};

/// Partition name to opaque resumption token.
pub type Cursors = BTreeMap<String, String>;

/// Configurable field key to field definition.
pub type ConfigurationMap = BTreeMap<String, ConfigurableField>;

/// Pipeline used when neither the connector nor the service defines one.
pub const DEFAULT_PIPELINE: &str = "ent-search-generic-ingestion";

/// One configurable field of a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurableField {
    pub label: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl ConfigurableField {
    pub fn new(label: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }

    /// A field has a value unless it is null or an empty string.
    pub fn has_value(&self) -> bool {
        match &self.value {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

/// Scheduling settings of a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scheduling {
    pub enabled: bool,
    /// Quartz-style cron expression.
    #[serde(default)]
    pub interval: Option<String>,
}

/// Validation result attached to a filter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterValidation {
    pub state: ValidationState,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl FilterValidation {
    pub fn valid() -> Self {
        Self {
            state: ValidationState::Valid,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            state: ValidationState::Invalid,
            errors,
        }
    }
}

/// A set of filtering rules with its validation status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub advanced_snippet: Option<Value>,
    #[serde(default)]
    pub validation: Option<FilterValidation>,
}

/// Draft and active filtering of a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filtering {
    #[serde(default)]
    pub draft: Option<FilterRules>,
    #[serde(default)]
    pub active: Option<FilterRules>,
}

/// Ingest pipeline name and the per-document flags derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub name: String,
    pub extract_binary_content: bool,
    pub reduce_whitespace: bool,
    pub run_ml_inference: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_PIPELINE.to_string(),
            extract_binary_content: true,
            reduce_whitespace: true,
            run_ml_inference: false,
        }
    }
}

/// A registered data source and its sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfiguration {
    pub id: String,
    pub service_type: Option<String>,
    pub index_name: String,
    pub status: ConnectorStatus,
    /// Listed by the native scheduler.
    pub is_native: bool,
    pub sync_now: bool,
    pub scheduling: Option<Scheduling>,
    pub last_synced: Option<DateTime<Utc>>,
    /// Kept as written so an unreadable value can be told apart from a missing one.
    pub last_seen: Option<String>,
    pub last_sync_status: Option<JobStatus>,
    pub last_sync_error: Option<String>,
    pub last_indexed_document_count: Option<u64>,
    pub last_deleted_document_count: Option<u64>,
    pub error: Option<String>,
    pub configuration: ConfigurationMap,
    pub cursors: Cursors,
    pub filtering: Option<Filtering>,
    pub pipeline: Option<PipelineSettings>,
}

impl ConnectorConfiguration {
    /// A freshly registered native connector in status `created`.
    pub fn new(id: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service_type: None,
            index_name: index_name.into(),
            status: ConnectorStatus::Created,
            is_native: true,
            sync_now: false,
            scheduling: None,
            last_synced: None,
            last_seen: None,
            last_sync_status: None,
            last_sync_error: None,
            last_indexed_document_count: None,
            last_deleted_document_count: None,
            error: None,
            configuration: ConfigurationMap::new(),
            cursors: Cursors::new(),
            filtering: None,
            pipeline: None,
        }
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn with_status(mut self, status: ConnectorStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_scheduling(mut self, enabled: bool, interval: Option<&str>) -> Self {
        self.scheduling = Some(Scheduling {
            enabled,
            interval: interval.map(str::to_string),
        });
        self
    }

    pub fn with_field(mut self, key: &str, label: &str, value: Option<Value>) -> Self {
        self.configuration
            .insert(key.to_string(), ConfigurableField::new(label, value));
        self
    }

    /// Connector id for log lines.
    pub fn formatted(&self) -> String {
        format!("connector {}", self.id)
    }

    pub fn needs_service_type(&self) -> bool {
        self.service_type.as_deref().is_none_or(str::is_empty)
    }

    /// Stored configuration keys.
    pub fn configuration_keys(&self) -> BTreeSet<String> {
        self.configuration.keys().cloned().collect()
    }

    pub fn configuration_initialized(&self) -> bool {
        !self.configuration.is_empty()
    }

    /// Parsed `last_seen`; `None` when missing or unreadable.
    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_seen.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Draft filter waiting for validation, if any.
    pub fn draft_pending_validation(&self) -> Option<&FilterRules> {
        let draft = self.filtering.as_ref()?.draft.as_ref()?;
        match &draft.validation {
            Some(validation) if validation.state == ValidationState::Edited => Some(draft),
            _ => None,
        }
    }

    /// Connector pipeline, then service defaults, then the built-in default.
    pub fn resolve_pipeline(&self, service_default: Option<&PipelineSettings>) -> PipelineSettings {
        self.pipeline
            .clone()
            .or_else(|| service_default.cloned())
            .unwrap_or_default()
    }
}

/// Field-scoped partial update of a connector record.
///
/// `None` leaves a field untouched. Nested `Option`s distinguish
/// "clear" (`Some(None)`) from "leave alone" (`None`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectorUpdate {
    pub status: Option<ConnectorStatus>,
    pub error: Option<Option<String>>,
    pub service_type: Option<String>,
    pub sync_now: Option<bool>,
    pub last_seen: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    pub last_sync_status: Option<JobStatus>,
    pub last_sync_error: Option<Option<String>>,
    pub last_indexed_document_count: Option<u64>,
    pub last_deleted_document_count: Option<u64>,
    pub configuration: Option<ConfigurationMap>,
    pub cursors: Option<Cursors>,
    pub filtering: Option<Filtering>,
}

impl ConnectorUpdate {
    /// Set the status and clear or set the error message with it.
    pub fn status(status: ConnectorStatus, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the update in place.
    pub fn apply(&self, connector: &mut ConnectorConfiguration) {
        if let Some(status) = self.status {
            connector.status = status;
        }
        if let Some(error) = &self.error {
            connector.error = error.clone();
        }
        if let Some(service_type) = &self.service_type {
            connector.service_type = Some(service_type.clone());
        }
        if let Some(sync_now) = self.sync_now {
            connector.sync_now = sync_now;
        }
        if let Some(last_seen) = &self.last_seen {
            connector.last_seen = Some(last_seen.clone());
        }
        if let Some(last_synced) = self.last_synced {
            connector.last_synced = Some(last_synced);
        }
        if let Some(status) = self.last_sync_status {
            connector.last_sync_status = Some(status);
        }
        if let Some(error) = &self.last_sync_error {
            connector.last_sync_error = error.clone();
        }
        if let Some(count) = self.last_indexed_document_count {
            connector.last_indexed_document_count = Some(count);
        }
        if let Some(count) = self.last_deleted_document_count {
            connector.last_deleted_document_count = Some(count);
        }
        if let Some(configuration) = &self.configuration {
            connector.configuration = configuration.clone();
        }
        if let Some(cursors) = &self.cursors {
            connector.cursors = cursors.clone();
        }
        if let Some(filtering) = &self.filtering {
            connector.filtering = Some(filtering.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_has_value() {
        assert!(!ConfigurableField::new("Host", None).has_value());
        assert!(!ConfigurableField::new("Host", Some(Value::Null)).has_value());
        assert!(!ConfigurableField::new("Host", Some(json!(""))).has_value());
        assert!(ConfigurableField::new("Host", Some(json!("example.com"))).has_value());
        assert!(ConfigurableField::new("Port", Some(json!(0))).has_value());
    }

    #[test]
    fn test_last_seen_parsing() {
        let mut connector = ConnectorConfiguration::new("c-1", "search-docs");
        assert!(connector.last_seen_at().is_none());

        connector.last_seen = Some("yesterday-ish".to_string());
        assert!(connector.last_seen_at().is_none());

        connector.last_seen = Some("2025-03-01T10:00:00Z".to_string());
        assert_eq!(
            connector.last_seen_at().unwrap().to_rfc3339(),
            "2025-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_draft_pending_validation() {
        let mut connector = ConnectorConfiguration::new("c-1", "search-docs");
        assert!(connector.draft_pending_validation().is_none());

        connector.filtering = Some(Filtering {
            draft: Some(FilterRules {
                validation: Some(FilterValidation::valid()),
                ..Default::default()
            }),
            active: None,
        });
        assert!(connector.draft_pending_validation().is_none());

        if let Some(draft) = connector
            .filtering
            .as_mut()
            .and_then(|f| f.draft.as_mut())
        {
            draft.validation = Some(FilterValidation {
                state: ValidationState::Edited,
                errors: vec![],
            });
        }
        assert!(connector.draft_pending_validation().is_some());
    }

    #[test]
    fn test_resolve_pipeline_order() {
        let mut connector = ConnectorConfiguration::new("c-1", "search-docs");
        assert_eq!(connector.resolve_pipeline(None).name, DEFAULT_PIPELINE);

        let service = PipelineSettings {
            name: "service-pipeline".into(),
            run_ml_inference: true,
            ..Default::default()
        };
        assert_eq!(
            connector.resolve_pipeline(Some(&service)).name,
            "service-pipeline"
        );

        connector.pipeline = Some(PipelineSettings {
            name: "own-pipeline".into(),
            ..Default::default()
        });
        assert_eq!(
            connector.resolve_pipeline(Some(&service)).name,
            "own-pipeline"
        );
    }

    #[test]
    fn test_update_apply_touches_only_set_fields() {
        let mut connector = ConnectorConfiguration::new("c-1", "search-docs")
            .with_status(ConnectorStatus::Connected);
        connector.error = Some("old".into());
        connector.sync_now = true;

        let update = ConnectorUpdate {
            sync_now: Some(false),
            last_sync_status: Some(JobStatus::InProgress),
            ..Default::default()
        };
        update.apply(&mut connector);

        assert!(!connector.sync_now);
        assert_eq!(connector.last_sync_status, Some(JobStatus::InProgress));
        assert_eq!(connector.status, ConnectorStatus::Connected);
        assert_eq!(connector.error.as_deref(), Some("old"));

        ConnectorUpdate::status(ConnectorStatus::Error, None).apply(&mut connector);
        assert_eq!(connector.status, ConnectorStatus::Error);
        assert!(connector.error.is_none());
    }
}
