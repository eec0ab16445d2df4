// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document-store collaborator.
//!
//! [`ConnectorStore`] is everything the engine needs from the external store:
//! connector records with field-scoped updates, job records with conditional
//! writes, and the target indices. Two backends are provided:
//!
//! - [`MemoryStore`] keeps everything in process, for tests and embedding.
//! - [`SqliteStore`] persists to SQLite through sqlx.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::connector::{ConnectorConfiguration, ConnectorUpdate};
use crate::error::Result;
use crate::extractor::Document;
use crate::job::{Completion, JobUpdate, SyncJob, VersionToken, WriteOutcome};
use crate::status::JobStatus;

/// Page size used when walking the ids of an index.
pub const DOCUMENT_ID_PAGE_SIZE: usize = 1000;

/// One write against a target index.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Upsert by document id.
    Index(Document),
    Delete(String),
}

impl BulkOperation {
    pub fn document_id(&self) -> &str {
        match self {
            Self::Index(document) => &document.id,
            Self::Delete(id) => id,
        }
    }
}

#[async_trait]
pub trait ConnectorStore: Send + Sync {
    /// Insert or replace a full connector record.
    async fn put_connector(&self, connector: &ConnectorConfiguration) -> Result<()>;

    async fn get_connector(&self, connector_id: &str) -> Result<Option<ConnectorConfiguration>>;

    async fn list_connectors(&self, native_only: bool) -> Result<Vec<ConnectorConfiguration>>;

    /// Remove a connector record. Its jobs are left for cleanup.
    async fn delete_connector(&self, connector_id: &str) -> Result<bool>;

    /// Write the fields set in `update`. Fails with
    /// [`SyncError::ConnectorNotFound`](crate::error::SyncError::ConnectorNotFound)
    /// for unknown connectors.
    async fn update_connector_fields(
        &self,
        connector_id: &str,
        update: &ConnectorUpdate,
    ) -> Result<()>;

    /// Atomically mark the connector busy and create an `in_progress` job.
    ///
    /// Returns `None` when the connector already has a run in progress.
    async fn claim_job(&self, connector_id: &str, worker_hostname: &str) -> Result<Option<String>>;

    /// Terminal write of a job plus the connector's last-sync fields, in one
    /// step, conditioned on `expected` and on the job not being terminal.
    async fn complete_sync(
        &self,
        connector_id: &str,
        job_id: &str,
        expected: VersionToken,
        completion: &Completion,
    ) -> Result<WriteOutcome<VersionToken>>;

    async fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>>;

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<SyncJob>>;

    /// Conditional non-terminal write of a job.
    async fn update_job_if_version(
        &self,
        job_id: &str,
        expected: VersionToken,
        update: &JobUpdate,
    ) -> Result<WriteOutcome<VersionToken>>;

    /// Returns the number of deleted jobs.
    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64>;

    async fn bulk(&self, index_name: &str, operations: &[BulkOperation]) -> Result<()>;

    /// Ids of `index_name` ordered ascending, strictly after `after`.
    async fn document_ids_page(
        &self,
        index_name: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    async fn document_count(&self, index_name: &str) -> Result<u64>;

    /// Every id currently stored in `index_name`.
    async fn fetch_document_ids(&self, index_name: &str) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        let mut after: Option<String> = None;

        loop {
            let page = self
                .document_ids_page(index_name, after.as_deref(), DOCUMENT_ID_PAGE_SIZE)
                .await?;
            let exhausted = page.len() < DOCUMENT_ID_PAGE_SIZE;
            after = page.last().cloned();
            ids.extend(page);

            if exhausted || after.is_none() {
                return Ok(ids);
            }
        }
    }
}
