// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resilient incremental extraction.
//!
//! A source implements [`Extractor`] and pushes each item through an
//! [`Emitter`]. The emitter is the per-document guard: fatal errors end the
//! stream, other failures are recorded by the [`ErrorMonitor`] and the
//! stream moves on. Changes travel over a bounded channel, so the consumer
//! pulls at its own pace.
//!
//! [`retry::RetryPolicy`] wraps the top-level calls with classified retries
//! and [`delta::DeltaExtractor`] provides the per-partition cursor pattern.

pub mod delta;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::connector::Cursors;
use crate::error::{Result, SyncError};
use crate::monitor::{DocumentError, ErrorMonitor};

/// Log a progress line every this many emitted changes.
const PROGRESS_LOG_EVERY: u64 = 100;

/// A document as ingested into the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Serialized size in bytes.
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Created or updated at the source.
    Upsert,
    /// Removed at the source.
    Delete,
}

/// One item of the change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub action: ChangeAction,
    pub document: Document,
}

impl DocumentChange {
    pub fn upsert(document: Document) -> Self {
        Self {
            action: ChangeAction::Upsert,
            document,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            action: ChangeAction::Delete,
            document: Document::new(id),
        }
    }
}

/// Capability interface implemented once per data source.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Emit every change since the emitter's stored cursors.
    ///
    /// Partitions update their cursor through [`Emitter::advance_cursor`]
    /// once fully traversed. The call may be repeated after a failure.
    async fn extract(&self, emitter: &mut Emitter) -> Result<()>;

    /// Subset of `ids` no longer present at the source.
    async fn deleted_ids(&self, ids: &[String]) -> Result<Vec<String>>;
}

/// Summary of a finished extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionReport {
    pub cursors: Cursors,
    pub cursors_modified: bool,
    pub emitted: u64,
    pub error_count: u64,
    pub errors: Vec<DocumentError>,
}

/// Sending half of the change stream with its per-document guard.
pub struct Emitter {
    sender: mpsc::Sender<DocumentChange>,
    monitor: ErrorMonitor,
    start_cursors: Cursors,
    cursors: Cursors,
    modified_since: Option<DateTime<Utc>>,
    emitted: u64,
}

impl Emitter {
    pub fn new(
        sender: mpsc::Sender<DocumentChange>,
        monitor: ErrorMonitor,
        cursors: Cursors,
        modified_since: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            sender,
            monitor,
            start_cursors: cursors.clone(),
            cursors,
            modified_since,
            emitted: 0,
        }
    }

    /// Stored cursor of a partition.
    pub fn cursor(&self, partition: &str) -> Option<&str> {
        self.cursors.get(partition).map(String::as_str)
    }

    pub fn modified_since(&self) -> Option<DateTime<Utc>> {
        self.modified_since
    }

    /// Record the cursor of a fully traversed partition.
    pub fn advance_cursor(&mut self, partition: &str, token: impl Into<String>) {
        self.cursors.insert(partition.to_string(), token.into());
    }

    /// Current cursor map, including partitions advanced in this run.
    pub fn cursors(&self) -> &Cursors {
        &self.cursors
    }

    pub fn cursors_modified_since_start(&self) -> bool {
        self.cursors != self.start_cursors
    }

    pub fn monitor(&self) -> &ErrorMonitor {
        &self.monitor
    }

    /// Emit the outcome of extracting one document.
    ///
    /// Fatal errors are returned to abort the stream. Other errors are
    /// recorded by the monitor, which may itself abort the run.
    pub async fn emit(&mut self, document_id: &str, item: Result<DocumentChange>) -> Result<()> {
        match item {
            Ok(change) => {
                self.monitor.note_success();
                self.sender
                    .send(change)
                    .await
                    .map_err(|_| SyncError::JobInterrupted("document consumer stopped".into()))?;

                self.emitted += 1;
                if self.emitted % PROGRESS_LOG_EVERY == 0 {
                    info!(count = self.emitted, "Extracted {} documents so far", self.emitted);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(
                    document_id = %document_id,
                    error = %e,
                    "Encountered a fall-through error during extraction of '{}'",
                    document_id
                );
                Err(e)
            }
            Err(e) => {
                warn!(
                    document_id = %document_id,
                    error = %e,
                    "Encountered error during extraction of '{}'",
                    document_id
                );
                self.monitor.note_error(&e, Some(document_id))?;
                Ok(())
            }
        }
    }

    /// Close the stream and summarise the run.
    ///
    /// Fails when the cumulative error ratio is over budget.
    pub fn finish(self) -> Result<ExtractionReport> {
        self.monitor.finalize()?;
        Ok(ExtractionReport {
            cursors_modified: self.cursors != self.start_cursors,
            cursors: self.cursors,
            emitted: self.emitted,
            error_count: self.monitor.error_count(),
            errors: self.monitor.errors().cloned().collect(),
        })
    }
}
