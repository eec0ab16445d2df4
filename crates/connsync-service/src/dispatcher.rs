// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Turns scheduler events into spawned tasks.
//!
//! Sync runs draw a permit from a bounded pool. When the pool is full the
//! event is dropped; the scheduler emits it again on a later pass. Heartbeat,
//! configuration and filter validation tasks are short and run unbounded.

use std::sync::Arc;

use connsync_core::{
    ConnectorConfiguration, ConnectorRegistry, ConnectorStore, RunnerConfig, SyncJobRunner,
    SyncOutcome, TaskKind, configuration, filtering, heartbeat,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    store: Arc<dyn ConnectorStore>,
    registry: Arc<ConnectorRegistry>,
    runner: Arc<SyncJobRunner>,
    sync_pool: Arc<Semaphore>,
    max_workers: usize,
    service_type: Option<String>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ConnectorStore>,
        registry: Arc<ConnectorRegistry>,
        runner_config: RunnerConfig,
        max_workers: usize,
        service_type: Option<String>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        let runner = Arc::new(SyncJobRunner::new(
            store.clone(),
            registry.clone(),
            runner_config,
        ));
        Self {
            store,
            registry,
            runner,
            sync_pool: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            service_type,
        }
    }

    /// Sync runs currently holding a pool permit.
    pub fn running_syncs(&self) -> usize {
        self.max_workers - self.sync_pool.available_permits()
    }

    /// Spawn the task for one event. Returns `None` when the event was dropped.
    pub fn dispatch(
        &self,
        connector: ConnectorConfiguration,
        task: TaskKind,
    ) -> Option<JoinHandle<()>> {
        match task {
            TaskKind::Sync => self.dispatch_sync(self.with_default_service_type(connector)),
            TaskKind::Heartbeat => {
                let store = self.store.clone();
                let registry = self.registry.clone();
                let service_type = self.service_type.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = heartbeat::send_heartbeat(
                        store.as_ref(),
                        &registry,
                        &connector.id,
                        service_type.as_deref(),
                    )
                    .await
                    {
                        log_failure(task, &connector, &e);
                    }
                }))
            }
            TaskKind::Configuration => {
                let store = self.store.clone();
                let registry = self.registry.clone();
                let service_type = self.service_type.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = configuration::bootstrap(
                        store.as_ref(),
                        &registry,
                        &connector,
                        service_type.as_deref(),
                    )
                    .await
                    {
                        log_failure(task, &connector, &e);
                    }
                }))
            }
            TaskKind::FilterValidation => {
                let connector = self.with_default_service_type(connector);
                let store = self.store.clone();
                let registry = self.registry.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) =
                        filtering::validate_draft(store.as_ref(), &registry, &connector).await
                    {
                        log_failure(task, &connector, &e);
                    }
                }))
            }
        }
    }

    /// Heartbeat and bootstrap write the default themselves; the other tasks
    /// only need it to find the source.
    fn with_default_service_type(
        &self,
        mut connector: ConnectorConfiguration,
    ) -> ConnectorConfiguration {
        if connector.needs_service_type() {
            connector.service_type = self.service_type.clone();
        }
        connector
    }

    fn dispatch_sync(&self, connector: ConnectorConfiguration) -> Option<JoinHandle<()>> {
        let Ok(permit) = self.sync_pool.clone().try_acquire_owned() else {
            warn!(
                connector_id = %connector.id,
                max_workers = self.max_workers,
                "Sync job pool is full, dropping sync event for {}",
                connector.formatted()
            );
            return None;
        };

        let runner = self.runner.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            match runner.execute(&connector).await {
                Ok(SyncOutcome::Finished(report)) => debug!(
                    connector_id = %connector.id,
                    job_id = %report.job_id,
                    status = %report.status,
                    "Sync task finished"
                ),
                Ok(outcome) => debug!(connector_id = %connector.id, ?outcome, "Sync task did not run"),
                Err(e) => log_failure(TaskKind::Sync, &connector, &e),
            }
        }))
    }

    /// Wait until every running sync has released its permit.
    pub async fn drain(&self) {
        info!(running = self.running_syncs(), "Waiting for running syncs to finish");
        match self.sync_pool.acquire_many(self.max_workers as u32).await {
            Ok(permits) => drop(permits),
            Err(e) => error!(error = %e, "Sync job pool closed while draining"),
        }
    }
}

fn log_failure(task: TaskKind, connector: &ConnectorConfiguration, e: &connsync_core::SyncError) {
    error!(
        connector_id = %connector.id,
        task = %task,
        error = %e,
        "{} task for {} failed due to unexpected error.",
        task_label(task),
        connector.formatted()
    );
}

fn task_label(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Sync => "Sync",
        TaskKind::Heartbeat => "Heartbeat",
        TaskKind::Configuration => "Configuration",
        TaskKind::FilterValidation => "Filter validation",
    }
}
