// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for orphaned and stuck sync jobs.
//!
//! Jobs whose connector no longer exists are deleted. Jobs still marked as
//! running that have not been touched within the threshold are terminated
//! with an error through the version-conditioned write, which also updates
//! the connector's last-sync fields. This covers workers that crashed or were
//! killed mid-run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use connsync_core::{ConnectorStore, IngestionStats, JobStatus, SyncJob, WriteOutcome};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Error installed on jobs terminated by the watchdog.
pub const STUCK_JOB_ERROR: &str = "The job has not seen any update for some time.";

/// Configuration for the job cleanup worker.
#[derive(Debug, Clone)]
pub struct JobCleanupConfig {
    /// How often to look for orphaned and stuck jobs.
    pub poll_interval: Duration,
    /// Maximum time since the last job update before it counts as stuck.
    pub stuck_threshold: Duration,
    /// Restrict cleanup to one connector's jobs.
    pub connector_id: Option<String>,
}

impl Default for JobCleanupConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(30),
            connector_id: None,
        }
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub orphaned_deleted: u64,
    pub stuck_terminated: u64,
}

/// Background worker that deletes orphaned jobs and fails stuck ones.
pub struct JobCleanup {
    store: Arc<dyn ConnectorStore>,
    config: JobCleanupConfig,
    shutdown: Arc<Notify>,
}

impl JobCleanup {
    pub fn new(store: Arc<dyn ConnectorStore>, config: JobCleanupConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run cleanup passes until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stuck_threshold_secs = self.config.stuck_threshold.as_secs(),
            "Job cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "Failed to clean up sync jobs");
                    }
                }
            }
        }

        info!("Job cleanup worker stopped");
    }

    /// One cleanup pass as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let scope = match &self.config.connector_id {
            Some(id) => format!("connector {}", id),
            None => "native connectors".to_string(),
        };

        info!("Start cleaning up orphaned jobs for {}...", scope);
        let orphaned_deleted = self.delete_orphaned_jobs().await?;

        info!("Start cleaning up stuck jobs for {}...", scope);
        let cutoff = now
            - chrono::Duration::from_std(self.config.stuck_threshold)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let stuck_terminated = self.terminate_stuck_jobs(cutoff).await?;

        Ok(CleanupReport {
            orphaned_deleted,
            stuck_terminated,
        })
    }

    fn in_scope(&self, job: &SyncJob) -> bool {
        self.config
            .connector_id
            .as_deref()
            .is_none_or(|id| job.connector.id == id)
    }

    async fn delete_orphaned_jobs(&self) -> Result<u64> {
        let connector_ids: HashSet<String> = self
            .store
            .list_connectors(false)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let orphaned: Vec<String> = self
            .store
            .list_jobs(None)
            .await?
            .into_iter()
            .filter(|job| self.in_scope(job) && !connector_ids.contains(&job.connector.id))
            .map(|job| job.id)
            .collect();

        if orphaned.is_empty() {
            info!("No orphaned jobs found. Skipping...");
            return Ok(0);
        }

        let deleted = self.store.delete_jobs(&orphaned).await?;
        info!(
            deleted = deleted,
            total = orphaned.len(),
            "Successfully deleted {} out of {} orphaned jobs.",
            deleted,
            orphaned.len()
        );
        Ok(deleted)
    }

    async fn terminate_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut stuck = Vec::new();
        for status in [JobStatus::InProgress, JobStatus::Canceling] {
            stuck.extend(
                self.store
                    .list_jobs(Some(status))
                    .await?
                    .into_iter()
                    .filter(|job| self.in_scope(job) && last_activity(job) < cutoff),
            );
        }

        if stuck.is_empty() {
            info!("No stuck jobs found. Skipping...");
            return Ok(0);
        }

        let mut terminated = 0;
        for mut job in stuck {
            let stats = IngestionStats {
                indexed_document_count: job.indexed_document_count,
                deleted_document_count: job.deleted_document_count,
                indexed_document_volume: job.indexed_document_volume,
            };
            match job.error(self.store.as_ref(), STUCK_JOB_ERROR, stats).await {
                Ok(WriteOutcome::Applied(())) => {
                    info!(job_id = %job.id, "Successfully marked job {} as error.", job.id);
                    terminated += 1;
                }
                Ok(WriteOutcome::Conflict) => {
                    debug!(job_id = %job.id, "Job {} was updated concurrently, leaving it alone", job.id);
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Could not mark job {} as error", job.id);
                }
            }
        }
        Ok(terminated)
    }
}

fn last_activity(job: &SyncJob) -> DateTime<Utc> {
    job.last_seen.or(job.started_at).unwrap_or(job.created_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use connsync_core::{ConnectorConfiguration, ConnectorStatus, MemoryStore};

    async fn store_with_job(connector_id: &str) -> (Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new());
        let connector = ConnectorConfiguration::new(connector_id, "search-x")
            .with_service_type("stub")
            .with_status(ConnectorStatus::Connected);
        store.put_connector(&connector).await.unwrap();
        let job_id = store.claim_job(connector_id, "worker").await.unwrap().unwrap();
        (store, job_id)
    }

    #[tokio::test]
    async fn test_stuck_job_is_terminated() {
        let (store, job_id) = store_with_job("c-1").await;
        let cleanup = JobCleanup::new(store.clone(), JobCleanupConfig::default());

        // fresh job is left alone
        let report = cleanup.run_once(Utc::now()).await.unwrap();
        assert_eq!(report, CleanupReport::default());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = cleanup.run_once(later).await.unwrap();
        assert_eq!(report.stuck_terminated, 1);

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some(STUCK_JOB_ERROR));

        let connector = store.get_connector("c-1").await.unwrap().unwrap();
        assert_eq!(connector.last_sync_status, Some(JobStatus::Error));
        assert_eq!(connector.last_sync_error.as_deref(), Some(STUCK_JOB_ERROR));

        // terminal jobs are not touched again
        let report = cleanup.run_once(later).await.unwrap();
        assert_eq!(report.stuck_terminated, 0);
    }

    #[tokio::test]
    async fn test_orphaned_jobs_are_deleted() {
        let (store, job_id) = store_with_job("c-1").await;
        let mut job = SyncJob::fetch(store.as_ref(), &job_id).await.unwrap();
        job.done(store.as_ref(), IngestionStats::default(), None)
            .await
            .unwrap();

        let cleanup = JobCleanup::new(store.clone(), JobCleanupConfig::default());
        assert_eq!(cleanup.run_once(Utc::now()).await.unwrap().orphaned_deleted, 0);

        assert!(store.delete_connector("c-1").await.unwrap());

        // another connector's scope does not see the orphan
        let scoped = JobCleanup::new(
            store.clone(),
            JobCleanupConfig {
                connector_id: Some("c-2".into()),
                ..Default::default()
            },
        );
        assert_eq!(scoped.run_once(Utc::now()).await.unwrap().orphaned_deleted, 0);
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);

        let report = cleanup.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.orphaned_deleted, 1);
        assert!(store.get_job(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stuck_job_of_deleted_connector_is_only_deleted() {
        let (store, job_id) = store_with_job("c-1").await;
        store.delete_connector("c-1").await.unwrap();
        let cleanup = JobCleanup::new(store.clone(), JobCleanupConfig::default());

        let later = Utc::now() + chrono::Duration::seconds(300);
        let report = cleanup.run_once(later).await.unwrap();

        assert_eq!(
            report,
            CleanupReport {
                orphaned_deleted: 1,
                stuck_terminated: 0
            }
        );
        assert!(store.get_job(&job_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let cleanup = Arc::new(JobCleanup::new(store, JobCleanupConfig::default()));
        let shutdown = cleanup.shutdown_handle();

        let handle = {
            let cleanup = cleanup.clone();
            tokio::spawn(async move { cleanup.run().await })
        };

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.notify_one();
        handle.await.unwrap();
    }
}
