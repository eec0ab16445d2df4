// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One sync run: claim, extract, diff, ingest, delete, finalize.
//!
//! The extractor produces into a bounded channel while the runner consumes
//! from it in the same task, so at most `channel_capacity` changes are in
//! flight. Whatever happens between the claim and the end of the run, the
//! job and the connector record are always finalized.

use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connector::{ConnectorConfiguration, ConnectorUpdate, Cursors, PipelineSettings};
use crate::error::{Result, SyncError, abbreviate};
use crate::extractor::retry::RetryPolicy;
use crate::extractor::{ChangeAction, Document, DocumentChange, Emitter, ExtractionReport, Extractor};
use crate::job::{IngestionStats, SyncJob, WriteOutcome};
use crate::monitor::{DocumentError, ErrorMonitor, MonitorConfig};
use crate::registry::{ConnectorRegistry, SourceConnector};
use crate::sink::{IndexSink, OutputSink};
use crate::status::{ConnectorStatus, JobStatus};
use crate::store::ConnectorStore;

/// Installed when a run ends without finishing and without a captured error.
pub const DID_NOT_FINISH_ERROR: &str =
    "Sync thread didn't finish execution. Check connector logs for more details.";

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Recorded on claimed jobs.
    pub worker_hostname: String,
    pub monitor: MonitorConfig,
    pub retry: RetryPolicy,
    /// Service-wide pipeline used when the connector defines none.
    pub default_pipeline: Option<PipelineSettings>,
    /// Changes buffered between extractor and runner.
    pub channel_capacity: usize,
    /// Touch the job this often while a run is going, in every phase.
    /// Must stay well below the stuck job threshold of the watchdog.
    pub job_heartbeat_interval: Duration,
    /// Passed to extractors for partitions without a cursor.
    pub modified_since: Option<DateTime<Utc>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_hostname: "localhost".to_string(),
            monitor: MonitorConfig::default(),
            retry: RetryPolicy::default(),
            default_pipeline: None,
            channel_capacity: 1,
            job_heartbeat_interval: Duration::from_secs(10),
            modified_since: None,
        }
    }
}

/// Summary of a claimed and finalized run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub job_id: String,
    pub status: JobStatus,
    pub stats: IngestionStats,
    pub error: Option<String>,
    pub document_errors: Vec<DocumentError>,
    pub cursors_modified: bool,
    /// False when another writer terminated the job first. `status` is then
    /// the status found in the store.
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The connector status does not allow syncing.
    Skipped { status: ConnectorStatus },
    /// The connector already has a run in progress.
    NotClaimed,
    Finished(SyncReport),
}

/// Ids the change stream reported during one run.
#[derive(Default)]
struct StreamedChanges {
    /// Upserted and not deleted afterwards.
    incoming: HashSet<String>,
    /// Upserted at some point.
    ingested: HashSet<String>,
    /// Deleted and not upserted afterwards.
    deleted: HashSet<String>,
}

#[derive(Default)]
struct RunState {
    indexed: u64,
    deleted: u64,
    cursors: Option<Cursors>,
    cursors_modified: bool,
    document_errors: Vec<DocumentError>,
    error: Option<SyncError>,
}

/// Executes sync runs against one store.
pub struct SyncJobRunner {
    store: Arc<dyn ConnectorStore>,
    registry: Arc<ConnectorRegistry>,
    config: RunnerConfig,
}

impl SyncJobRunner {
    pub fn new(
        store: Arc<dyn ConnectorStore>,
        registry: Arc<ConnectorRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run a sync writing into the connector's index.
    pub async fn execute(&self, connector: &ConnectorConfiguration) -> Result<SyncOutcome> {
        let mut sink = IndexSink::new(self.store.clone(), connector.index_name.clone());
        self.execute_with_sink(connector, &mut sink).await
    }

    /// Run a sync writing into `sink`.
    ///
    /// Errors before the claim are returned. Once a job is claimed, failures
    /// end up in the job record and the returned report instead.
    pub async fn execute_with_sink(
        &self,
        connector: &ConnectorConfiguration,
        sink: &mut dyn OutputSink,
    ) -> Result<SyncOutcome> {
        let source = self.registry.for_connector(connector)?;
        let mut connector = connector.clone();

        if !connector.configuration_initialized() {
            connector.configuration = source.configurable_fields();
            let update = ConnectorUpdate {
                configuration: Some(connector.configuration.clone()),
                ..Default::default()
            };
            self.store
                .update_connector_fields(&connector.id, &update)
                .await?;
        }

        validate_configuration(source.as_ref(), &connector)?;

        if !connector.status.allows_sync() {
            info!(
                connector_id = %connector.id,
                status = %connector.status,
                "Connector {} is in status \"{}\" and won't sync yet",
                connector.id,
                connector.status
            );
            return Ok(SyncOutcome::Skipped {
                status: connector.status,
            });
        }

        info!(connector_id = %connector.id, "Starting sync for connector {}", connector.id);

        let Some(job_id) = self
            .store
            .claim_job(&connector.id, &self.config.worker_hostname)
            .await?
        else {
            info!(connector_id = %connector.id, "No job claimed for connector {}", connector.id);
            return Ok(SyncOutcome::NotClaimed);
        };
        debug!(connector_id = %connector.id, job_id = %job_id, "Successfully claimed job");

        let mut job = SyncJob::fetch(self.store.as_ref(), &job_id).await?;
        let mut run = RunState::default();

        let result = {
            let work = AssertUnwindSafe(self.sync(&connector, source.as_ref(), &mut *sink, &mut run))
                .catch_unwind();
            tokio::pin!(work);

            let period = self.config.job_heartbeat_interval.max(Duration::from_millis(10));
            let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = heartbeat.tick() => match job.touch(self.store.as_ref()).await {
                        Ok(WriteOutcome::Applied(())) => {
                            debug!(job_id = %job.id, "Job heartbeat");
                        }
                        Ok(WriteOutcome::Conflict) => {
                            break Ok(Err(SyncError::JobInterrupted(format!(
                                "job {} was modified by another process",
                                job.id
                            ))));
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Failed to update job heartbeat");
                        }
                    },
                }
            }
        };

        let finished = match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(connector_id = %connector.id, job_id = %job_id, error = %e, "Sync failed");
                run.error = Some(e);
                false
            }
            Err(_) => {
                error!(connector_id = %connector.id, job_id = %job_id, "Sync panicked");
                false
            }
        };

        let volume = sink.ingestion_stats().indexed_document_volume;
        Ok(SyncOutcome::Finished(
            self.finalize(&connector, &mut job, run, finished, volume)
                .await,
        ))
    }

    async fn sync(
        &self,
        connector: &ConnectorConfiguration,
        source: &dyn SourceConnector,
        sink: &mut dyn OutputSink,
        run: &mut RunState,
    ) -> Result<()> {
        let extractor = source.extractor(connector)?;

        if let Err(e) = source.health_check(connector).await {
            error!(
                connector_id = %connector.id,
                error = %e,
                "Connector {} was unable to reach out to the 3rd-party service",
                connector.id
            );
            return Err(e);
        }
        self.store
            .update_connector_fields(
                &connector.id,
                &ConnectorUpdate::status(ConnectorStatus::Connected, None),
            )
            .await?;

        let existing_ids = self.store.fetch_document_ids(&connector.index_name).await?;
        debug!(
            index = %connector.index_name,
            count = existing_ids.len(),
            "{} documents are present in index {}",
            existing_ids.len(),
            connector.index_name
        );

        let (changes, report) = self.stream(connector, extractor.as_ref(), sink, run).await?;

        run.cursors_modified = report.cursors_modified;
        run.document_errors = report.errors.clone();

        let mut keep = changes.incoming.clone();

        // after an incremental run, ids the stream never mentioned may still exist
        if !connector.cursors.is_empty() {
            let mut unseen: Vec<String> = existing_ids
                .iter()
                .filter(|id| !changes.incoming.contains(*id) && !changes.deleted.contains(*id))
                .cloned()
                .collect();
            unseen.sort();

            let gone: HashSet<String> = self
                .config
                .retry
                .deleted_ids(extractor.as_ref(), &unseen, &report.cursors)
                .await?
                .into_iter()
                .collect();
            keep.extend(unseen.into_iter().filter(|id| !gone.contains(id)));
        }

        let mut ids_to_delete: BTreeSet<String> = existing_ids.difference(&keep).cloned().collect();
        // deleted at the source after being ingested in this run
        ids_to_delete.extend(
            changes
                .deleted
                .iter()
                .filter(|id| changes.ingested.contains(*id))
                .cloned(),
        );

        info!(
            index = %connector.index_name,
            count = ids_to_delete.len(),
            "Deleting {} documents from index {}",
            ids_to_delete.len(),
            connector.index_name
        );
        for id in ids_to_delete {
            sink.delete(id).await?;
            run.deleted += 1;
        }
        sink.flush().await?;

        run.cursors = Some(report.cursors);
        Ok(())
    }

    /// Pump changes from the extractor into the sink.
    async fn stream(
        &self,
        connector: &ConnectorConfiguration,
        extractor: &dyn Extractor,
        sink: &mut dyn OutputSink,
        run: &mut RunState,
    ) -> Result<(StreamedChanges, ExtractionReport)> {
        let pipeline = connector.resolve_pipeline(self.config.default_pipeline.as_ref());
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let emitter = Emitter::new(
            tx,
            ErrorMonitor::new(self.config.monitor.clone()),
            connector.cursors.clone(),
            self.config.modified_since,
        );

        let retry = &self.config.retry;
        let producer = async move {
            let mut emitter = emitter;
            retry.extract(extractor, &mut emitter).await?;
            emitter.finish()
        };

        let consumer = async {
            let mut rx = rx;
            let mut changes = StreamedChanges::default();

            while let Some(DocumentChange { action, document }) = rx.recv().await {
                if document.id.is_empty() {
                    warn!(connector_id = %connector.id, "Skipping a document without id");
                    continue;
                }
                match action {
                    ChangeAction::Upsert => {
                        let document = with_pipeline_flags(document, &pipeline);
                        let id = document.id.clone();
                        sink.ingest(document).await?;
                        run.indexed += 1;
                        changes.deleted.remove(&id);
                        changes.ingested.insert(id.clone());
                        changes.incoming.insert(id);
                    }
                    ChangeAction::Delete => {
                        changes.incoming.remove(&document.id);
                        changes.deleted.insert(document.id);
                    }
                }
            }

            Ok::<_, SyncError>(changes)
        };

        let (produced, consumed) = tokio::join!(producer, consumer);
        // a failed consumer closes the channel, so its error comes first
        let changes = consumed?;
        let report = produced?;

        Ok((changes, report))
    }

    async fn finalize(
        &self,
        connector: &ConnectorConfiguration,
        job: &mut SyncJob,
        run: RunState,
        finished: bool,
        indexed_document_volume: u64,
    ) -> SyncReport {
        let mut error = run.error.as_ref().map(|e| abbreviate(&e.to_string()));
        if !finished && error.is_none() {
            error = Some(DID_NOT_FINISH_ERROR.to_string());
        }

        let stats = IngestionStats {
            indexed_document_count: run.indexed,
            deleted_document_count: run.deleted,
            indexed_document_volume,
        };
        let cursors = if finished {
            run.cursors
        } else {
            run.error
                .as_ref()
                .and_then(SyncError::cursor_snapshot)
                .cloned()
        };

        let status_update = match &error {
            Some(message) => ConnectorUpdate::status(ConnectorStatus::Error, Some(message.clone())),
            None => ConnectorUpdate::status(ConnectorStatus::Connected, None),
        };
        if let Err(e) = self
            .store
            .update_connector_fields(&connector.id, &status_update)
            .await
        {
            error!(connector_id = %connector.id, error = %e, "Failed to update connector status");
        }

        let store = self.store.as_ref();
        let outcome = match &error {
            Some(message) => job.fail(store, message, stats, cursors).await,
            None => job.done(store, stats, cursors).await,
        };
        let intended = if error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        let finalized = match outcome {
            Ok(WriteOutcome::Applied(())) => true,
            Ok(WriteOutcome::Conflict) => {
                warn!(
                    connector_id = %connector.id,
                    job_id = %job.id,
                    "Job was terminated by another process, final status not written"
                );
                false
            }
            Err(e) => {
                error!(connector_id = %connector.id, job_id = %job.id, error = %e, "Failed to finalize job");
                false
            }
        };

        let status = if finalized {
            intended
        } else {
            match self.store.get_job(&job.id).await {
                Ok(Some(stored)) => stored.status,
                _ => job.status,
            }
        };

        info!(
            index = %connector.index_name,
            "Upserted {} documents into {}",
            stats.indexed_document_count,
            connector.index_name
        );
        info!(
            index = %connector.index_name,
            "Deleted {} documents from {}",
            stats.deleted_document_count,
            connector.index_name
        );
        match &error {
            Some(message) => info!(
                connector_id = %connector.id,
                "Failed to sync for connector {} with error {}",
                connector.id,
                message
            ),
            None => info!(connector_id = %connector.id, "Successfully synced for connector {}", connector.id),
        }

        SyncReport {
            job_id: job.id.clone(),
            status,
            stats,
            error,
            document_errors: run.document_errors,
            cursors_modified: run.cursors_modified,
            finalized,
        }
    }
}

/// Stored configuration keys must match the source's configurable fields.
pub fn validate_configuration(
    source: &dyn SourceConnector,
    connector: &ConnectorConfiguration,
) -> Result<()> {
    let expected: Vec<String> = source.configurable_fields().into_keys().collect();
    let actual: Vec<String> = connector.configuration_keys().into_iter().collect();

    if expected != actual {
        return Err(SyncError::IncompatibleConfigurableFields {
            service_type: source.service_type().to_string(),
            expected: expected.join(", "),
            actual: actual.join(", "),
        });
    }
    Ok(())
}

/// Attach the ingest-time flags of the pipeline to a document.
pub fn with_pipeline_flags(document: Document, pipeline: &PipelineSettings) -> Document {
    document
        .with_field("_extract_binary_content", pipeline.extract_binary_content)
        .with_field("_reduce_whitespace", pipeline.reduce_whitespace)
        .with_field("_run_ml_inference", pipeline.run_ml_inference)
}
