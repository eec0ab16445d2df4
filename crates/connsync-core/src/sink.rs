// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output sinks receiving the upserts and deletes of a run.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::extractor::Document;
use crate::job::IngestionStats;
use crate::store::{BulkOperation, ConnectorStore};

/// Flush after this many queued operations.
pub const BULK_COUNT_THRESHOLD: usize = 500;
/// Flush after this many queued bytes.
pub const BULK_SIZE_THRESHOLD: usize = 5 * 1024 * 1024;

#[async_trait]
pub trait OutputSink: Send {
    async fn ingest(&mut self, document: Document) -> Result<()>;

    async fn delete(&mut self, document_id: String) -> Result<()>;

    async fn ingest_multiple(&mut self, documents: Vec<Document>) -> Result<()> {
        for document in documents {
            self.ingest(document).await?;
        }
        Ok(())
    }

    async fn delete_multiple(&mut self, document_ids: Vec<String>) -> Result<()> {
        for id in document_ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    /// Write out anything still buffered.
    async fn flush(&mut self) -> Result<()>;

    fn ingestion_stats(&self) -> IngestionStats;
}

/// Buffer of pending bulk operations with count and size thresholds.
#[derive(Debug)]
pub struct BulkQueue {
    count_threshold: usize,
    size_threshold: usize,
    operations: Vec<BulkOperation>,
    current_size: usize,
    total_data_size: u64,
}

impl Default for BulkQueue {
    fn default() -> Self {
        Self::new(BULK_COUNT_THRESHOLD, BULK_SIZE_THRESHOLD)
    }
}

impl BulkQueue {
    pub fn new(count_threshold: usize, size_threshold: usize) -> Self {
        Self {
            count_threshold,
            size_threshold,
            operations: Vec::new(),
            current_size: 0,
            total_data_size: 0,
        }
    }

    pub fn push(&mut self, operation: BulkOperation) {
        let size = match &operation {
            BulkOperation::Index(document) => {
                let payload = document.byte_size();
                self.total_data_size += payload as u64;
                payload
            }
            BulkOperation::Delete(id) => id.len(),
        };
        self.current_size += size;
        self.operations.push(operation);
    }

    pub fn is_full(&self) -> bool {
        self.operations.len() >= self.count_threshold || self.current_size >= self.size_threshold
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Take the queued operations, leaving the queue empty.
    pub fn take(&mut self) -> Vec<BulkOperation> {
        self.current_size = 0;
        std::mem::take(&mut self.operations)
    }

    /// Payload bytes of every upsert ever queued.
    pub fn total_data_size(&self) -> u64 {
        self.total_data_size
    }
}

/// Writes into a target index of a [`ConnectorStore`].
pub struct IndexSink {
    store: Arc<dyn ConnectorStore>,
    index_name: String,
    queue: BulkQueue,
    indexed: u64,
    deleted: u64,
}

impl IndexSink {
    pub fn new(store: Arc<dyn ConnectorStore>, index_name: impl Into<String>) -> Self {
        Self::with_queue(store, index_name, BulkQueue::default())
    }

    pub fn with_queue(
        store: Arc<dyn ConnectorStore>,
        index_name: impl Into<String>,
        queue: BulkQueue,
    ) -> Self {
        Self {
            store,
            index_name: index_name.into(),
            queue,
            indexed: 0,
            deleted: 0,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn flush_if_full(&mut self) -> Result<()> {
        if self.queue.is_full() {
            self.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutputSink for IndexSink {
    async fn ingest(&mut self, document: Document) -> Result<()> {
        if document.id.is_empty() {
            return Ok(());
        }
        self.queue.push(BulkOperation::Index(document));
        self.indexed += 1;
        self.flush_if_full().await
    }

    async fn delete(&mut self, document_id: String) -> Result<()> {
        if document_id.is_empty() {
            return Ok(());
        }
        self.queue.push(BulkOperation::Delete(document_id));
        self.deleted += 1;
        self.flush_if_full().await
    }

    async fn ingest_multiple(&mut self, documents: Vec<Document>) -> Result<()> {
        debug!(
            index = %self.index_name,
            count = documents.len(),
            "Enqueueing {} documents to the index {}",
            documents.len(),
            self.index_name
        );
        for document in documents {
            self.ingest(document).await?;
        }
        Ok(())
    }

    async fn delete_multiple(&mut self, document_ids: Vec<String>) -> Result<()> {
        debug!(
            index = %self.index_name,
            count = document_ids.len(),
            "Enqueueing {} ids to delete from the index {}",
            document_ids.len(),
            self.index_name
        );
        for id in document_ids {
            self.delete(id).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }

        let operations = self.queue.take();
        self.store.bulk(&self.index_name, &operations).await?;
        info!(
            index = %self.index_name,
            operations = operations.len(),
            "Applied {} upsert/delete operations to the index {}",
            operations.len(),
            self.index_name
        );
        Ok(())
    }

    fn ingestion_stats(&self) -> IngestionStats {
        IngestionStats {
            indexed_document_count: self.indexed,
            deleted_document_count: self.deleted,
            indexed_document_volume: self.queue.total_data_size(),
        }
    }
}

/// Prints one JSON line per operation.
pub struct ConsoleSink<W> {
    writer: W,
    stats: IngestionStats,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            stats: IngestionStats::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: serde_json::Value) -> Result<()> {
        writeln!(self.writer, "{}", line).map_err(|e| SyncError::Other(e.to_string()))
    }
}

#[async_trait]
impl<W: Write + Send> OutputSink for ConsoleSink<W> {
    async fn ingest(&mut self, document: Document) -> Result<()> {
        self.stats.indexed_document_count += 1;
        self.stats.indexed_document_volume += document.byte_size() as u64;
        self.write_line(json!({ "index": document }))
    }

    async fn delete(&mut self, document_id: String) -> Result<()> {
        self.stats.deleted_document_count += 1;
        self.write_line(json!({ "delete": { "id": document_id } }))
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| SyncError::Other(e.to_string()))
    }

    fn ingestion_stats(&self) -> IngestionStats {
        self.stats
    }
}

/// Fans every operation out to several sinks. Stats come from the first.
pub struct CombinedSink {
    sinks: Vec<Box<dyn OutputSink>>,
}

impl CombinedSink {
    pub fn new(sinks: Vec<Box<dyn OutputSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl OutputSink for CombinedSink {
    async fn ingest(&mut self, document: Document) -> Result<()> {
        for sink in &mut self.sinks {
            sink.ingest(document.clone()).await?;
        }
        Ok(())
    }

    async fn delete(&mut self, document_id: String) -> Result<()> {
        for sink in &mut self.sinks {
            sink.delete(document_id.clone()).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush().await?;
        }
        Ok(())
    }

    fn ingestion_stats(&self) -> IngestionStats {
        self.sinks
            .first()
            .map(|sink| sink.ingestion_stats())
            .unwrap_or_default()
    }
}
