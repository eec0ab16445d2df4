// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BulkOperation, ConnectorStore};
use crate::connector::{ConnectorConfiguration, ConnectorUpdate};
use crate::error::{Result, SyncError};
use crate::extractor::Document;
use crate::job::{Completion, ConnectorSnapshot, JobUpdate, SyncJob, VersionToken, WriteOutcome};
use crate::status::JobStatus;

#[derive(Default)]
struct MemoryState {
    connectors: BTreeMap<String, ConnectorConfiguration>,
    jobs: BTreeMap<String, SyncJob>,
    indices: HashMap<String, BTreeMap<String, Document>>,
}

/// [`ConnectorStore`] kept behind a single async mutex. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents of an index, ordered by id.
    pub async fn documents(&self, index_name: &str) -> Vec<Document> {
        let state = self.state.lock().await;
        state
            .indices
            .get(index_name)
            .map(|index| index.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConnectorStore for MemoryStore {
    async fn put_connector(&self, connector: &ConnectorConfiguration) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .connectors
            .insert(connector.id.clone(), connector.clone());
        Ok(())
    }

    async fn get_connector(&self, connector_id: &str) -> Result<Option<ConnectorConfiguration>> {
        let state = self.state.lock().await;
        Ok(state.connectors.get(connector_id).cloned())
    }

    async fn list_connectors(&self, native_only: bool) -> Result<Vec<ConnectorConfiguration>> {
        let state = self.state.lock().await;
        Ok(state
            .connectors
            .values()
            .filter(|c| !native_only || c.is_native)
            .cloned()
            .collect())
    }

    async fn delete_connector(&self, connector_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.connectors.remove(connector_id).is_some())
    }

    async fn update_connector_fields(
        &self,
        connector_id: &str,
        update: &ConnectorUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let connector = state
            .connectors
            .get_mut(connector_id)
            .ok_or_else(|| SyncError::ConnectorNotFound(connector_id.to_string()))?;
        update.apply(connector);
        Ok(())
    }

    async fn claim_job(&self, connector_id: &str, worker_hostname: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let connector = state
            .connectors
            .get_mut(connector_id)
            .ok_or_else(|| SyncError::ConnectorNotFound(connector_id.to_string()))?;

        if connector.last_sync_status == Some(JobStatus::InProgress) {
            return Ok(None);
        }

        let now = Utc::now();
        connector.sync_now = false;
        connector.last_sync_status = Some(JobStatus::InProgress);
        connector.last_synced = Some(now);

        let job = SyncJob {
            id: Uuid::new_v4().to_string(),
            connector: ConnectorSnapshot::of(connector),
            status: JobStatus::InProgress,
            created_at: now,
            started_at: Some(now),
            last_seen: Some(now),
            completed_at: None,
            canceled_at: None,
            error: None,
            indexed_document_count: 0,
            deleted_document_count: 0,
            total_document_count: 0,
            indexed_document_volume: 0,
            worker_hostname: Some(worker_hostname.to_string()),
            version: VersionToken {
                seq_no: 0,
                primary_term: 1,
            },
        };
        let job_id = job.id.clone();
        state.jobs.insert(job_id.clone(), job);

        Ok(Some(job_id))
    }

    async fn complete_sync(
        &self,
        connector_id: &str,
        job_id: &str,
        expected: VersionToken,
        completion: &Completion,
    ) -> Result<WriteOutcome<VersionToken>> {
        let mut state = self.state.lock().await;
        if !state.connectors.contains_key(connector_id) {
            return Err(SyncError::ConnectorNotFound(connector_id.to_string()));
        }

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SyncError::JobNotFound(job_id.to_string()))?;
        if job.version != expected || job.status.is_terminal() {
            return Ok(WriteOutcome::Conflict);
        }

        job.status = completion.status;
        job.error = completion.error.clone();
        job.last_seen = Some(completion.completed_at);
        job.completed_at = Some(completion.completed_at);
        job.canceled_at = completion.canceled_at;
        job.indexed_document_count = completion.stats.indexed_document_count;
        job.deleted_document_count = completion.stats.deleted_document_count;
        job.indexed_document_volume = completion.stats.indexed_document_volume;
        job.total_document_count = completion.total_document_count;
        job.version = job.version.next();
        let version = job.version;

        let update = ConnectorUpdate {
            last_sync_status: Some(completion.status),
            last_sync_error: Some(completion.error.clone()),
            last_synced: Some(completion.completed_at),
            last_indexed_document_count: Some(completion.stats.indexed_document_count),
            last_deleted_document_count: Some(completion.stats.deleted_document_count),
            cursors: completion.cursors.clone(),
            ..Default::default()
        };
        if let Some(connector) = state.connectors.get_mut(connector_id) {
            update.apply(connector);
        }

        Ok(WriteOutcome::Applied(version))
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<SyncJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect())
    }

    async fn update_job_if_version(
        &self,
        job_id: &str,
        expected: VersionToken,
        update: &JobUpdate,
    ) -> Result<WriteOutcome<VersionToken>> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| SyncError::JobNotFound(job_id.to_string()))?;
        if job.version != expected || job.status.is_terminal() {
            return Ok(WriteOutcome::Conflict);
        }

        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(last_seen) = update.last_seen {
            job.last_seen = Some(last_seen);
        }
        if let Some(error) = &update.error {
            job.error = error.clone();
        }
        job.version = job.version.next();

        Ok(WriteOutcome::Applied(job.version))
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(job_ids
            .iter()
            .filter(|id| state.jobs.remove(*id).is_some())
            .count() as u64)
    }

    async fn bulk(&self, index_name: &str, operations: &[BulkOperation]) -> Result<()> {
        let mut state = self.state.lock().await;
        let index = state.indices.entry(index_name.to_string()).or_default();
        for operation in operations {
            match operation {
                BulkOperation::Index(document) => {
                    index.insert(document.id.clone(), document.clone());
                }
                BulkOperation::Delete(id) => {
                    index.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn document_ids_page(
        &self,
        index_name: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let Some(index) = state.indices.get(index_name) else {
            return Ok(Vec::new());
        };

        Ok(index
            .keys()
            .filter(|id| after.is_none_or(|a| id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn document_count(&self, index_name: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .indices
            .get(index_name)
            .map_or(0, |index| index.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ConnectorStatus;

    fn connector(id: &str) -> ConnectorConfiguration {
        ConnectorConfiguration::new(id, "search-docs")
            .with_service_type("stub")
            .with_status(ConnectorStatus::Connected)
    }

    #[tokio::test]
    async fn test_claim_marks_connector_busy() {
        let store = MemoryStore::new();
        let mut c = connector("c-1");
        c.sync_now = true;
        store.put_connector(&c).await.unwrap();

        let job_id = store.claim_job("c-1", "worker-1").await.unwrap().unwrap();

        let stored = store.get_connector("c-1").await.unwrap().unwrap();
        assert!(!stored.sync_now);
        assert_eq!(stored.last_sync_status, Some(JobStatus::InProgress));

        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.worker_hostname.as_deref(), Some("worker-1"));
        assert_eq!(job.connector.index_name, "search-docs");

        // a second claim finds the connector busy
        assert!(store.claim_job("c-1", "worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_unknown_connector() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.claim_job("missing", "worker-1").await,
            Err(SyncError::ConnectorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_job() {
        let store = MemoryStore::new();
        store.put_connector(&connector("c-1")).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .claim_job("c-1", &format!("worker-{}", i))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_document_id_paging() {
        let store = MemoryStore::new();
        let ops: Vec<_> = (0..2500)
            .map(|i| BulkOperation::Index(Document::new(format!("doc-{:05}", i))))
            .collect();
        store.bulk("search-docs", &ops).await.unwrap();

        let first = store
            .document_ids_page("search-docs", None, 1000)
            .await
            .unwrap();
        assert_eq!(first.len(), 1000);
        assert_eq!(first[0], "doc-00000");

        let ids = store.fetch_document_ids("search-docs").await.unwrap();
        assert_eq!(ids.len(), 2500);
        assert_eq!(store.document_count("search-docs").await.unwrap(), 2500);
        assert!(store.fetch_document_ids("search-empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_connector() {
        let store = MemoryStore::new();
        let update = ConnectorUpdate::status(ConnectorStatus::Error, Some("boom".into()));
        assert!(store.update_connector_fields("nope", &update).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_jobs() {
        let store = MemoryStore::new();
        store.put_connector(&connector("c-1")).await.unwrap();
        let job_id = store.claim_job("c-1", "w").await.unwrap().unwrap();

        let deleted = store
            .delete_jobs(&[job_id.clone(), "other".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_job(&job_id).await.unwrap().is_none());
    }
}
