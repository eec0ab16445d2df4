// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sync job records and their transition protocol.
//!
//! A job is created `in_progress` by [`ConnectorStore::claim_job`]. Every
//! later write is conditioned on the [`VersionToken`] read with the record:
//! a stale token yields [`WriteOutcome::Conflict`] and the write is not
//! applied. Callers re-read with [`SyncJob::fetch`] and decide again.
//! Terminal statuses are never written over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connector::{ConfigurationMap, ConnectorConfiguration, Cursors, PipelineSettings};
use crate::error::{Result, SyncError, abbreviate};
use crate::status::JobStatus;
use crate::store::ConnectorStore;

/// Optimistic concurrency tokens of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToken {
    pub seq_no: i64,
    pub primary_term: i64,
}

impl VersionToken {
    /// Token after one more write in the same term.
    pub fn next(self) -> Self {
        Self {
            seq_no: self.seq_no + 1,
            primary_term: self.primary_term,
        }
    }
}

/// Result of a conditional write.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T = ()> {
    /// The write was applied.
    Applied(T),
    /// Another writer got there first; nothing was written.
    Conflict,
}

impl<T> WriteOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// Counters reported by the output sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStats {
    pub indexed_document_count: u64,
    pub deleted_document_count: u64,
    pub indexed_document_volume: u64,
}

/// Connector fields copied into the job at claim time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSnapshot {
    pub id: String,
    pub index_name: String,
    pub service_type: Option<String>,
    pub pipeline: PipelineSettings,
    pub configuration: ConfigurationMap,
}

impl ConnectorSnapshot {
    pub fn of(connector: &ConnectorConfiguration) -> Self {
        Self {
            id: connector.id.clone(),
            index_name: connector.index_name.clone(),
            service_type: connector.service_type.clone(),
            pipeline: connector.resolve_pipeline(None),
            configuration: connector.configuration.clone(),
        }
    }
}

/// One run attempt of a connector sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub id: String,
    pub connector: ConnectorSnapshot,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub indexed_document_count: u64,
    pub deleted_document_count: u64,
    pub total_document_count: u64,
    pub indexed_document_volume: u64,
    pub worker_hostname: Option<String>,
    pub version: VersionToken,
}

/// Non-terminal fields written by a conditional job update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub last_seen: Option<DateTime<Utc>>,
    pub error: Option<Option<String>>,
}

/// Terminal write for a job and the matching last-sync fields of its connector.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: JobStatus,
    pub error: Option<String>,
    pub stats: IngestionStats,
    pub total_document_count: u64,
    pub completed_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Cursor map to persist on the connector, if any.
    pub cursors: Option<Cursors>,
}

impl SyncJob {
    /// Load a job or fail with [`SyncError::JobNotFound`].
    pub async fn fetch(store: &dyn ConnectorStore, job_id: &str) -> Result<SyncJob> {
        store
            .get_job(job_id)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(job_id.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn in_progress(&self) -> bool {
        self.status == JobStatus::InProgress
    }

    pub fn canceling(&self) -> bool {
        self.status == JobStatus::Canceling
    }

    /// Record a heartbeat.
    pub async fn touch(&mut self, store: &dyn ConnectorStore) -> Result<WriteOutcome> {
        let now = Utc::now();
        let update = JobUpdate {
            last_seen: Some(now),
            ..Default::default()
        };

        match store
            .update_job_if_version(&self.id, self.version, &update)
            .await?
        {
            WriteOutcome::Applied(version) => {
                self.last_seen = Some(now);
                self.version = version;
                Ok(WriteOutcome::Applied(()))
            }
            WriteOutcome::Conflict => Ok(WriteOutcome::Conflict),
        }
    }

    /// Move to a non-terminal status such as `canceling` or `suspended`.
    pub async fn transition(
        &mut self,
        store: &dyn ConnectorStore,
        status: JobStatus,
    ) -> Result<WriteOutcome> {
        if status.is_terminal() {
            return Err(SyncError::Other(format!(
                "status {} must be written through a termination",
                status
            )));
        }
        self.check_transition(status)?;

        let now = Utc::now();
        let update = JobUpdate {
            status: Some(status),
            last_seen: Some(now),
            ..Default::default()
        };

        match store
            .update_job_if_version(&self.id, self.version, &update)
            .await?
        {
            WriteOutcome::Applied(version) => {
                debug!(job_id = %self.id, from = %self.status, to = %status, "Job transitioned");
                self.status = status;
                self.last_seen = Some(now);
                self.version = version;
                Ok(WriteOutcome::Applied(()))
            }
            WriteOutcome::Conflict => Ok(WriteOutcome::Conflict),
        }
    }

    /// Finish successfully.
    pub async fn done(
        &mut self,
        store: &dyn ConnectorStore,
        stats: IngestionStats,
        cursors: Option<Cursors>,
    ) -> Result<WriteOutcome> {
        self.terminate(store, JobStatus::Completed, None, stats, cursors)
            .await
    }

    /// Finish with the error that ended the run.
    pub async fn fail(
        &mut self,
        store: &dyn ConnectorStore,
        error: &str,
        stats: IngestionStats,
        cursors: Option<Cursors>,
    ) -> Result<WriteOutcome> {
        self.terminate(store, JobStatus::Failed, Some(error), stats, cursors)
            .await
    }

    /// Terminate with an error raised outside the run, e.g. by a watchdog.
    pub async fn error(
        &mut self,
        store: &dyn ConnectorStore,
        error: &str,
        stats: IngestionStats,
    ) -> Result<WriteOutcome> {
        self.terminate(store, JobStatus::Error, Some(error), stats, None)
            .await
    }

    pub async fn cancel(
        &mut self,
        store: &dyn ConnectorStore,
        stats: IngestionStats,
    ) -> Result<WriteOutcome> {
        self.terminate(store, JobStatus::Canceled, None, stats, None)
            .await
    }

    async fn terminate(
        &mut self,
        store: &dyn ConnectorStore,
        status: JobStatus,
        error: Option<&str>,
        stats: IngestionStats,
        cursors: Option<Cursors>,
    ) -> Result<WriteOutcome> {
        self.check_transition(status)?;

        let total_document_count = store.document_count(&self.connector.index_name).await?;
        let now = Utc::now();
        let completion = Completion {
            status,
            error: error.map(abbreviate),
            stats,
            total_document_count,
            completed_at: now,
            canceled_at: (status == JobStatus::Canceled).then_some(now),
            cursors,
        };

        match store
            .complete_sync(&self.connector.id, &self.id, self.version, &completion)
            .await?
        {
            WriteOutcome::Applied(version) => {
                info!(
                    job_id = %self.id,
                    connector_id = %self.connector.id,
                    status = %status,
                    indexed = stats.indexed_document_count,
                    deleted = stats.deleted_document_count,
                    total = total_document_count,
                    "Job terminated"
                );
                self.status = status;
                self.error = completion.error;
                self.last_seen = Some(now);
                self.completed_at = Some(now);
                self.canceled_at = completion.canceled_at;
                self.indexed_document_count = stats.indexed_document_count;
                self.deleted_document_count = stats.deleted_document_count;
                self.indexed_document_volume = stats.indexed_document_volume;
                self.total_document_count = total_document_count;
                self.version = version;
                Ok(WriteOutcome::Applied(()))
            }
            WriteOutcome::Conflict => Ok(WriteOutcome::Conflict),
        }
    }

    fn check_transition(&self, to: JobStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(SyncError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Document;
    use crate::status::ConnectorStatus;
    use crate::store::{BulkOperation, ConnectorStore, MemoryStore};

    async fn claimed_job(store: &MemoryStore) -> SyncJob {
        let connector = ConnectorConfiguration::new("c-1", "search-docs")
            .with_service_type("stub")
            .with_status(ConnectorStatus::Connected);
        store.put_connector(&connector).await.unwrap();

        let job_id = store.claim_job("c-1", "worker-1").await.unwrap().unwrap();
        SyncJob::fetch(store, &job_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_done_records_total_count() {
        let store = MemoryStore::new();
        let mut job = claimed_job(&store).await;
        store
            .bulk(
                "search-docs",
                &[
                    BulkOperation::Index(Document::new("a")),
                    BulkOperation::Index(Document::new("b")),
                ],
            )
            .await
            .unwrap();

        let stats = IngestionStats {
            indexed_document_count: 2,
            ..Default::default()
        };
        assert!(job.done(&store, stats, None).await.unwrap().is_applied());

        let stored = SyncJob::fetch(&store, &job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.total_document_count, 2);
        assert_eq!(stored.indexed_document_count, 2);
        assert!(stored.completed_at.is_some());
        assert!(stored.canceled_at.is_none());
        assert!(stored.error.is_none());
        assert_eq!(stored.version, job.version);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStore::new();
        let mut first = claimed_job(&store).await;
        let mut second = first.clone();

        assert!(first.touch(&store).await.unwrap().is_applied());

        let outcome = second
            .error(&store, "stuck", IngestionStats::default())
            .await
            .unwrap();
        assert!(outcome.is_conflict());
        assert_eq!(second.status, JobStatus::InProgress);

        let stored = SyncJob::fetch(&store, &first.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn test_exactly_one_racing_terminator_wins() {
        let store = MemoryStore::new();
        let job = claimed_job(&store).await;
        let mut watchdog = job.clone();
        let mut runner = job.clone();

        let a = watchdog
            .error(&store, "not seen for a while", IngestionStats::default())
            .await
            .unwrap();
        let b = runner
            .done(&store, IngestionStats::default(), None)
            .await
            .unwrap();

        assert!(a.is_applied());
        assert!(b.is_conflict());
        let stored = SyncJob::fetch(&store, &job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_terminal_jobs_reject_transitions() {
        let store = MemoryStore::new();
        let mut job = claimed_job(&store).await;
        job.cancel(&store, IngestionStats::default()).await.unwrap();
        assert!(job.canceled_at.is_some());

        let err = job
            .done(&store, IngestionStats::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidTransition {
                from: JobStatus::Canceled,
                to: JobStatus::Completed,
                ..
            }
        ));

        // heartbeats are rejected by the store too
        assert!(job.touch(&store).await.unwrap().is_conflict());
    }

    #[tokio::test]
    async fn test_fail_updates_connector_last_sync() {
        let store = MemoryStore::new();
        let mut job = claimed_job(&store).await;

        job.fail(&store, "Could not refresh token", IngestionStats::default(), None)
            .await
            .unwrap();

        let connector = store.get_connector("c-1").await.unwrap().unwrap();
        assert_eq!(connector.last_sync_status, Some(JobStatus::Failed));
        assert_eq!(
            connector.last_sync_error.as_deref(),
            Some("Could not refresh token")
        );
    }

    #[tokio::test]
    async fn test_non_terminal_transition() {
        let store = MemoryStore::new();
        let mut job = claimed_job(&store).await;

        assert!(job
            .transition(&store, JobStatus::Canceling)
            .await
            .unwrap()
            .is_applied());
        assert!(job.canceling());
        assert!(job.transition(&store, JobStatus::Failed).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_missing_job() {
        let store = MemoryStore::new();
        assert!(matches!(
            SyncJob::fetch(&store, "nope").await,
            Err(SyncError::JobNotFound(_))
        ));
    }
}
