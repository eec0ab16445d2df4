// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cursor-based incremental traversal of paginated delta sources.
//!
//! For every partition the stored cursor is used first. A cursor the source
//! rejects falls back to a full traversal of that partition for this run.
//! Without a cursor, a `modified_since` timestamp is used when given,
//! otherwise the partition is fully traversed. Pages are followed until
//! exhausted and the final delta token becomes the new cursor.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{Document, DocumentChange, Emitter, Extractor};
use crate::error::{Result, SyncError};

/// Which page of a partition to fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaQuery {
    Full,
    SinceCursor(String),
    SinceTime(DateTime<Utc>),
    NextPage(String),
}

/// An item as returned by a delta source.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaItem {
    pub id: String,
    pub deleted: bool,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaPage {
    pub items: Vec<DeltaItem>,
    /// Link to the next page, if any.
    pub next_page: Option<String>,
    /// Resumption token, present on the last page.
    pub delta_token: Option<String>,
}

/// A paginated source exposing change feeds per partition.
#[async_trait]
pub trait DeltaSource: Send + Sync {
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Fetch one page. A rejected cursor is reported as
    /// [`SyncError::InvalidCursor`].
    async fn fetch_page(&self, partition: &str, query: &DeltaQuery) -> Result<DeltaPage>;

    /// Which of `ids` still exist at the source.
    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Map a source item to a document.
    fn to_document(&self, _partition: &str, item: DeltaItem) -> Result<Document> {
        Ok(Document {
            id: item.id,
            fields: item.fields,
        })
    }
}

/// [`Extractor`] over any [`DeltaSource`].
pub struct DeltaExtractor<S> {
    source: S,
}

impl<S: DeltaSource> DeltaExtractor<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    async fn first_page(&self, partition: &str, emitter: &Emitter) -> Result<DeltaPage> {
        if let Some(cursor) = emitter.cursor(partition).map(str::to_string) {
            return match self
                .source
                .fetch_page(partition, &DeltaQuery::SinceCursor(cursor))
                .await
            {
                Err(SyncError::InvalidCursor { .. }) => {
                    warn!(
                        partition = %partition,
                        "Stored cursor was rejected, running a full traversal of the partition"
                    );
                    self.source.fetch_page(partition, &DeltaQuery::Full).await
                }
                other => other,
            };
        }

        match emitter.modified_since() {
            Some(since) => {
                self.source
                    .fetch_page(partition, &DeltaQuery::SinceTime(since))
                    .await
            }
            None => self.source.fetch_page(partition, &DeltaQuery::Full).await,
        }
    }

    /// Walk every page of a partition. Returns the final delta token.
    async fn traverse(&self, partition: &str, emitter: &mut Emitter) -> Result<Option<String>> {
        let mut page = self.first_page(partition, emitter).await?;
        let mut pages = 1u64;

        loop {
            let DeltaPage {
                items,
                next_page,
                delta_token,
            } = page;

            for item in items {
                let id = item.id.clone();
                let change = if item.deleted {
                    Ok(DocumentChange::delete(item.id))
                } else {
                    self.source
                        .to_document(partition, item)
                        .map(DocumentChange::upsert)
                };
                emitter.emit(&id, change).await?;
            }

            match next_page {
                Some(link) => {
                    page = self
                        .source
                        .fetch_page(partition, &DeltaQuery::NextPage(link))
                        .await?;
                    pages += 1;
                }
                None => {
                    debug!(partition = %partition, pages = pages, "Partition traversed");
                    return Ok(delta_token);
                }
            }
        }
    }
}

#[async_trait]
impl<S: DeltaSource> Extractor for DeltaExtractor<S> {
    async fn extract(&self, emitter: &mut Emitter) -> Result<()> {
        for partition in self.source.partitions().await? {
            if let Some(token) = self.traverse(&partition, emitter).await? {
                emitter.advance_cursor(&partition, token);
            }
        }
        Ok(())
    }

    async fn deleted_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let present = self.source.existing_ids(ids).await?;
        Ok(ids
            .iter()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect())
    }
}
