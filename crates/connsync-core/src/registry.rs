// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source implementations keyed by service type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connector::{ConfigurationMap, ConnectorConfiguration, FilterRules, FilterValidation};
use crate::error::{Result, SyncError};
use crate::extractor::Extractor;

/// A data source implementation.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn service_type(&self) -> &str;

    /// Default configurable fields. Their keys are the set a stored
    /// configuration must match.
    fn configurable_fields(&self) -> ConfigurationMap;

    /// Check that the source can be reached with the stored configuration.
    async fn health_check(&self, connector: &ConnectorConfiguration) -> Result<()>;

    /// Build the extractor for one run.
    fn extractor(&self, connector: &ConnectorConfiguration) -> Result<Box<dyn Extractor>>;

    /// Validate a draft filter definition.
    async fn validate_filtering(&self, _filter: &FilterRules) -> Result<FilterValidation> {
        Ok(FilterValidation::valid())
    }
}

/// Explicit map of service type to implementation.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under its own service type, replacing any
    /// previous one.
    pub fn register(&mut self, source: Arc<dyn SourceConnector>) {
        self.sources.insert(source.service_type().to_string(), source);
    }

    pub fn get(&self, service_type: &str) -> Option<Arc<dyn SourceConnector>> {
        self.sources.get(service_type).cloned()
    }

    /// Implementation for a connector's service type.
    pub fn for_connector(
        &self,
        connector: &ConnectorConfiguration,
    ) -> Result<Arc<dyn SourceConnector>> {
        let service_type = connector.service_type.as_deref().unwrap_or_default();
        self.get(service_type)
            .ok_or_else(|| SyncError::UnregisteredServiceType(service_type.to_string()))
    }

    pub fn is_registered(&self, service_type: Option<&str>) -> bool {
        service_type.is_some_and(|s| self.sources.contains_key(s))
    }

    /// Registered service types, sorted.
    pub fn service_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.sources.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Emitter;

    struct Empty;

    #[async_trait]
    impl Extractor for Empty {
        async fn extract(&self, _emitter: &mut Emitter) -> Result<()> {
            Ok(())
        }

        async fn deleted_ids(&self, _ids: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct Named(&'static str);

    #[async_trait]
    impl SourceConnector for Named {
        fn service_type(&self) -> &str {
            self.0
        }

        fn configurable_fields(&self) -> ConfigurationMap {
            ConfigurationMap::new()
        }

        async fn health_check(&self, _connector: &ConnectorConfiguration) -> Result<()> {
            Ok(())
        }

        fn extractor(&self, _connector: &ConnectorConfiguration) -> Result<Box<dyn Extractor>> {
            Ok(Box::new(Empty))
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Named("mongodb")));
        registry.register(Arc::new(Named("gitlab")));

        assert!(registry.is_registered(Some("gitlab")));
        assert!(!registry.is_registered(Some("sharepoint")));
        assert!(!registry.is_registered(None));
        assert_eq!(registry.service_types(), vec!["gitlab", "mongodb"]);

        let connector = ConnectorConfiguration::new("c-1", "search-x").with_service_type("mongodb");
        let source = registry.for_connector(&connector).unwrap();
        assert_eq!(source.service_type(), "mongodb");
        assert_eq!(
            source
                .validate_filtering(&FilterRules::default())
                .await
                .unwrap(),
            FilterValidation::valid()
        );

        let unknown = ConnectorConfiguration::new("c-2", "search-x");
        assert!(matches!(
            registry.for_connector(&unknown),
            Err(SyncError::UnregisteredServiceType(_))
        ));
    }
}
