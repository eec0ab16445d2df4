// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling control loop deciding which tasks to trigger per connector.
//!
//! Each pass fetches the connectors from a [`ConnectorProvider`], evaluates
//! the sync, heartbeat, configuration and filter-validation predicates in
//! that order and emits one event per predicate that holds. Predicates only
//! look at already-fetched state. Shutdown is checked between passes; the
//! sleep between passes is cut short by a shutdown request.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::connector::ConnectorConfiguration;
use crate::cron::{next_occurrence_after, quartz_to_crontab};
use crate::error::Result;
use crate::registry::ConnectorRegistry;
use crate::status::ConnectorStatus;
use crate::store::ConnectorStore;

/// Task triggered for a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Sync,
    Heartbeat,
    Configuration,
    FilterValidation,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Heartbeat => "heartbeat",
            Self::Configuration => "configuration",
            Self::FilterValidation => "filter_validation",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between passes.
    pub poll_interval: Duration,
    /// A heartbeat is due once `last_seen` is older than this.
    pub heartbeat_interval: Duration,
    /// Index names must start with this prefix to be synced.
    pub index_prefix: String,
    /// Service type assumed for connectors that have none stored.
    pub default_service_type: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1800),
            index_prefix: "search-".to_string(),
            default_service_type: None,
        }
    }
}

/// Supplies the connectors considered on each pass.
///
/// Fetch failures are logged by the provider and yield an empty list.
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    async fn connectors(&self) -> Vec<ConnectorConfiguration>;
}

/// Every connector flagged native.
pub struct NativeConnectors {
    store: Arc<dyn ConnectorStore>,
}

impl NativeConnectors {
    pub fn new(store: Arc<dyn ConnectorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConnectorProvider for NativeConnectors {
    async fn connectors(&self) -> Vec<ConnectorConfiguration> {
        match self.store.list_connectors(true).await {
            Ok(connectors) => connectors,
            Err(e) => {
                error!(error = %e, "Could not retrieve native connectors due to unexpected error.");
                Vec::new()
            }
        }
    }
}

/// One connector, by id.
pub struct SingleConnector {
    store: Arc<dyn ConnectorStore>,
    connector_id: String,
}

impl SingleConnector {
    pub fn new(store: Arc<dyn ConnectorStore>, connector_id: impl Into<String>) -> Self {
        Self {
            store,
            connector_id: connector_id.into(),
        }
    }
}

#[async_trait]
impl ConnectorProvider for SingleConnector {
    async fn connectors(&self) -> Vec<ConnectorConfiguration> {
        match self.store.get_connector(&self.connector_id).await {
            Ok(Some(connector)) => vec![connector],
            Ok(None) => {
                warn!(connector_id = %self.connector_id, "Connector {} does not exist", self.connector_id);
                Vec::new()
            }
            Err(e) => {
                error!(
                    connector_id = %self.connector_id,
                    error = %e,
                    "Could not retrieve the connector by id {} due to unexpected error.",
                    self.connector_id
                );
                Vec::new()
            }
        }
    }
}

/// Requests a cooperative scheduler shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

pub struct Scheduler<P> {
    provider: P,
    registry: Arc<ConnectorRegistry>,
    config: SchedulerConfig,
    shutting_down: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<P: ConnectorProvider> Scheduler<P> {
    pub fn new(provider: P, registry: Arc<ConnectorRegistry>, config: SchedulerConfig) -> Self {
        Self {
            provider,
            registry,
            config,
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutting_down.clone(),
            notify: self.shutdown.clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Poll until shutdown, handing every triggered task to `emit`.
    ///
    /// `emit` failures are logged and do not stop the loop.
    pub async fn run<F>(&self, mut emit: F)
    where
        F: FnMut(ConnectorConfiguration, TaskKind) -> Result<()> + Send,
    {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            self.pass(Utc::now(), &mut emit).await;

            if self.is_shutting_down() {
                info!("Shutting down scheduler");
                break;
            }

            if !self.config.poll_interval.is_zero() {
                debug!(
                    "Sleeping for {} seconds in scheduler",
                    self.config.poll_interval.as_secs()
                );
                tokio::select! {
                    biased;
                    _ = self.shutdown.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Evaluate every connector once.
    pub async fn pass<F>(&self, now: DateTime<Utc>, emit: &mut F)
    where
        F: FnMut(ConnectorConfiguration, TaskKind) -> Result<()> + Send,
    {
        for connector in self.provider.connectors().await {
            for task in self.triggered_tasks(&connector, now) {
                if let Err(e) = emit(connector.clone(), task) {
                    error!(
                        connector_id = %connector.id,
                        task = %task,
                        error = %e,
                        "Failed to dispatch {} task for {}",
                        task,
                        connector.formatted()
                    );
                }
            }
        }
    }

    /// Tasks due for `connector` at `now`, in evaluation order.
    pub fn triggered_tasks(
        &self,
        connector: &ConnectorConfiguration,
        now: DateTime<Utc>,
    ) -> Vec<TaskKind> {
        let mut tasks = Vec::new();
        if self.sync_triggered(connector, now) {
            tasks.push(TaskKind::Sync);
        }
        if self.heartbeat_triggered(connector, now) {
            tasks.push(TaskKind::Heartbeat);
        }
        if self.configuration_triggered(connector) {
            tasks.push(TaskKind::Configuration);
        }
        if self.filter_validation_triggered(connector) {
            tasks.push(TaskKind::FilterValidation);
        }
        tasks
    }

    pub fn sync_triggered(&self, connector: &ConnectorConfiguration, now: DateTime<Utc>) -> bool {
        if !self.connector_registered(connector) {
            return false;
        }

        if !connector.index_name.starts_with(&self.config.index_prefix) {
            warn!(
                connector_id = %connector.id,
                index = %connector.index_name,
                "The index name of {} is invalid",
                connector.formatted()
            );
            return false;
        }

        if !connector.status.allows_sync() {
            info!(
                connector_id = %connector.id,
                status = %connector.status,
                "{} is in status \"{}\" and won't sync yet",
                connector.formatted(),
                connector.status
            );
            return false;
        }

        if connector.sync_now {
            info!(connector_id = %connector.id, "{} is manually triggered to sync now", connector.formatted());
            return true;
        }

        let Some(scheduling) = connector.scheduling.as_ref().filter(|s| s.enabled) else {
            debug!(connector_id = %connector.id, "{} scheduling is disabled", connector.formatted());
            return false;
        };

        let Some(last_synced) = connector.last_synced else {
            info!(
                connector_id = %connector.id,
                "{} has never synced yet, running initial sync",
                connector.formatted()
            );
            return true;
        };

        let Some(interval) = scheduling.interval.as_deref().filter(|i| !i.trim().is_empty())
        else {
            warn!(connector_id = %connector.id, "No sync schedule configured for {}", connector.formatted());
            return false;
        };

        let crontab = match quartz_to_crontab(interval) {
            Ok(crontab) => crontab,
            Err(e) => {
                error!(
                    connector_id = %connector.id,
                    interval = %interval,
                    error = %e,
                    "Unable to convert quartz ({}) to crontab",
                    interval
                );
                return false;
            }
        };

        let next = match next_occurrence_after(&crontab, last_synced) {
            Ok(next) => next,
            Err(e) => {
                error!(
                    connector_id = %connector.id,
                    crontab = %crontab,
                    error = %e,
                    "Unable to parse sync schedule for {}",
                    connector.formatted()
                );
                return false;
            }
        };

        if next <= now {
            info!(
                connector_id = %connector.id,
                "{} sync is triggered by cron schedule {}",
                connector.formatted(),
                crontab
            );
            return true;
        }
        false
    }

    pub fn heartbeat_triggered(&self, connector: &ConnectorConfiguration, now: DateTime<Utc>) -> bool {
        if !self.connector_registered(connector) {
            return false;
        }

        let Some(raw) = connector.last_seen.as_deref().filter(|s| !s.is_empty()) else {
            return true;
        };
        let Some(last_seen) = connector.last_seen_at() else {
            warn!(connector_id = %connector.id, last_seen = %raw, "Unable to parse last_seen {}", raw);
            return true;
        };

        let interval = chrono::Duration::from_std(self.config.heartbeat_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        last_seen + interval < now
    }

    pub fn configuration_triggered(&self, connector: &ConnectorConfiguration) -> bool {
        self.connector_registered(connector) && connector.status == ConnectorStatus::Created
    }

    pub fn filter_validation_triggered(&self, connector: &ConnectorConfiguration) -> bool {
        self.connector_registered(connector) && connector.draft_pending_validation().is_some()
    }

    fn connector_registered(&self, connector: &ConnectorConfiguration) -> bool {
        let service_type = if connector.needs_service_type() {
            self.config.default_service_type.as_deref()
        } else {
            connector.service_type.as_deref()
        };

        if self.registry.is_registered(service_type) {
            true
        } else {
            warn!(
                connector_id = %connector.id,
                service_type = ?service_type,
                "The service type ({}) is not supported",
                service_type.unwrap_or_default()
            );
            false
        }
    }
}
