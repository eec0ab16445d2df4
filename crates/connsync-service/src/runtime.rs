// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable service runtime: scheduler, dispatcher and job cleanup.

use std::sync::Arc;

use connsync_core::scheduler::ShutdownHandle;
use connsync_core::{
    ConnectorProvider, ConnectorRegistry, ConnectorStore, NativeConnectors, Scheduler,
    SingleConnector,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::job_cleanup::JobCleanup;

/// A running connsync service.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination: the scheduler
/// finishes its pass, the cleanup worker stops and running syncs drain.
pub struct ServiceRuntime {
    scheduler_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    scheduler_shutdown: ShutdownHandle,
    cleanup_shutdown: Arc<Notify>,
    dispatcher: Arc<Dispatcher>,
}

impl ServiceRuntime {
    /// Spawn the scheduler and cleanup tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &ServiceConfig,
        store: Arc<dyn ConnectorStore>,
        registry: Arc<ConnectorRegistry>,
    ) -> Result<Self> {
        if registry.is_empty() {
            warn!("No source connectors registered, no connector will be synced");
        }

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            config.runner_config(),
            config.max_workers,
            config.service_type.clone(),
        ));

        let (scheduler_handle, scheduler_shutdown) = if config.native_mode {
            spawn_scheduler(
                Scheduler::new(
                    NativeConnectors::new(store.clone()),
                    registry.clone(),
                    config.scheduler_config(),
                ),
                dispatcher.clone(),
            )
        } else {
            let connector_id = config
                .connector_id
                .clone()
                .ok_or_else(|| Error::Other("no connector id configured".into()))?;
            spawn_scheduler(
                Scheduler::new(
                    SingleConnector::new(store.clone(), connector_id),
                    registry.clone(),
                    config.scheduler_config(),
                ),
                dispatcher.clone(),
            )
        };

        let cleanup = JobCleanup::new(store, config.cleanup_config());
        let cleanup_shutdown = cleanup.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup.run().await;
        });

        info!(
            native_mode = config.native_mode,
            service_types = ?registry.service_types(),
            max_workers = config.max_workers,
            worker_hostname = %config.worker_hostname,
            "ServiceRuntime started"
        );

        Ok(Self {
            scheduler_handle,
            cleanup_handle,
            scheduler_shutdown,
            cleanup_shutdown,
            dispatcher,
        })
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished() && !self.cleanup_handle.is_finished()
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("ServiceRuntime shutting down...");

        self.scheduler_shutdown.shutdown();
        self.cleanup_shutdown.notify_one();

        let mut failed = false;
        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
            failed = true;
        }
        if let Err(e) = self.cleanup_handle.await {
            error!("Job cleanup task panicked: {}", e);
            failed = true;
        }

        self.dispatcher.drain().await;

        if failed {
            return Err(Error::Other("background task panicked".into()));
        }
        info!("ServiceRuntime shutdown complete");
        Ok(())
    }
}

fn spawn_scheduler<P>(
    scheduler: Scheduler<P>,
    dispatcher: Arc<Dispatcher>,
) -> (JoinHandle<()>, ShutdownHandle)
where
    P: ConnectorProvider + 'static,
{
    let shutdown = scheduler.shutdown_handle();
    let handle = tokio::spawn(async move {
        scheduler
            .run(move |connector, task| {
                dispatcher.dispatch(connector, task);
                Ok(())
            })
            .await;
    });
    (handle, shutdown)
}
