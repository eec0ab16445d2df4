// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for connsync-core integration tests.
//!
//! Provides a scripted source connector and store fixtures.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

use connsync_core::connector::{ConfigurableField, ConfigurationMap};
use connsync_core::error::NetworkErrorKind;
use connsync_core::store::BulkOperation;
use connsync_core::{
    ConnectorConfiguration, ConnectorRegistry, ConnectorStatus, ConnectorStore, Document,
    DocumentChange, Emitter, Extractor, RunnerConfig, SourceConnector, SqliteStore, SyncError,
    SyncJobRunner,
};

pub const SERVICE_TYPE: &str = "scripted";
pub const INDEX: &str = "search-docs";

/// One scripted extraction step, replayed on every attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Upsert(&'static str),
    Delete(&'static str),
    /// A per-document failure.
    DocError(&'static str),
    /// Advance a partition cursor.
    Cursor(&'static str, &'static str),
    /// A network failure at this point of the run.
    Network,
    /// A fatal token refresh failure.
    Fatal,
    Panic,
    /// Sleep this many milliseconds.
    Pause(u64),
}

#[derive(Default)]
struct Script {
    steps: Vec<Step>,
    /// Remaining attempts that fail before emitting anything.
    failures_before_start: AtomicU32,
    /// Fail those attempts with an unclassified error instead of a network one.
    unclassified_failures: bool,
    attempts: AtomicU32,
    gone: Vec<String>,
}

/// Source whose extractor replays a fixed script.
#[derive(Clone)]
pub struct ScriptedSource {
    script: Arc<Script>,
    healthy: bool,
    fields: ConfigurationMap,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Script {
                steps,
                ..Default::default()
            }),
            healthy: true,
            fields: default_fields(),
        }
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn failing_first(self, attempts: u32) -> Self {
        self.script
            .failures_before_start
            .store(attempts, Ordering::SeqCst);
        self
    }

    /// Like [`failing_first`](Self::failing_first) with an unclassified source error.
    pub fn flaky_first(self, attempts: u32) -> Self {
        let script = Script {
            steps: self.script.steps.clone(),
            failures_before_start: AtomicU32::new(attempts),
            unclassified_failures: true,
            attempts: AtomicU32::new(0),
            gone: self.script.gone.clone(),
        };
        Self {
            script: Arc::new(script),
            ..self
        }
    }

    /// Ids reported as deleted at the source.
    pub fn with_gone(self, ids: &[&str]) -> Self {
        let script = Script {
            steps: self.script.steps.clone(),
            failures_before_start: AtomicU32::new(
                self.script.failures_before_start.load(Ordering::SeqCst),
            ),
            unclassified_failures: self.script.unclassified_failures,
            attempts: AtomicU32::new(0),
            gone: ids.iter().map(|id| id.to_string()).collect(),
        };
        Self {
            script: Arc::new(script),
            ..self
        }
    }

    /// Number of times extraction was started.
    pub fn attempts(&self) -> u32 {
        self.script.attempts.load(Ordering::SeqCst)
    }
}

pub fn default_fields() -> ConfigurationMap {
    let mut fields = ConfigurationMap::new();
    fields.insert(
        "host".to_string(),
        ConfigurableField::new("Host", Some(json!("localhost"))),
    );
    fields
}

#[async_trait]
impl SourceConnector for ScriptedSource {
    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn configurable_fields(&self) -> ConfigurationMap {
        self.fields.clone()
    }

    async fn health_check(&self, _connector: &ConnectorConfiguration) -> connsync_core::Result<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(SyncError::Source("host unreachable".into()))
        }
    }

    fn extractor(
        &self,
        _connector: &ConnectorConfiguration,
    ) -> connsync_core::Result<Box<dyn Extractor>> {
        Ok(Box::new(ScriptedExtractor {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedExtractor {
    script: Arc<Script>,
}

fn network_error() -> SyncError {
    SyncError::Network {
        kind: NetworkErrorKind::Connection,
        message: "connection reset by peer".into(),
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, emitter: &mut Emitter) -> connsync_core::Result<()> {
        self.script.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.script.failures_before_start.load(Ordering::SeqCst);
        if remaining > 0 {
            self.script
                .failures_before_start
                .store(remaining - 1, Ordering::SeqCst);
            if self.script.unclassified_failures {
                return Err(SyncError::Source("HTTP 502 Bad Gateway".into()));
            }
            return Err(network_error());
        }

        for step in &self.script.steps {
            match step {
                Step::Upsert(id) => {
                    let document = Document::new(*id).with_field("title", format!("Doc {}", id));
                    emitter.emit(id, Ok(DocumentChange::upsert(document))).await?;
                }
                Step::Delete(id) => {
                    emitter.emit(id, Ok(DocumentChange::delete(*id))).await?;
                }
                Step::DocError(id) => {
                    let error = SyncError::Document {
                        id: id.to_string(),
                        message: "unreadable attachment".into(),
                    };
                    emitter.emit(id, Err(error)).await?;
                }
                Step::Cursor(partition, token) => emitter.advance_cursor(partition, *token),
                Step::Network => return Err(network_error()),
                Step::Fatal => return Err(SyncError::TokenRefreshFailed("refresh token expired".into())),
                Step::Panic => panic!("scripted extractor panicked"),
                Step::Pause(millis) => tokio::time::sleep(Duration::from_millis(*millis)).await,
            }
        }
        Ok(())
    }

    async fn deleted_ids(&self, ids: &[String]) -> connsync_core::Result<Vec<String>> {
        Ok(ids
            .iter()
            .filter(|id| self.script.gone.contains(id))
            .cloned()
            .collect())
    }
}

/// A connected connector of the scripted service type.
pub fn connector() -> ConnectorConfiguration {
    ConnectorConfiguration::new("c-1", INDEX)
        .with_service_type(SERVICE_TYPE)
        .with_status(ConnectorStatus::Connected)
        .with_field("host", "Host", Some(json!("localhost")))
}

pub fn registry(source: ScriptedSource) -> Arc<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new();
    registry.register(Arc::new(source));
    Arc::new(registry)
}

pub fn runner(
    store: Arc<dyn ConnectorStore>,
    source: ScriptedSource,
    config: RunnerConfig,
) -> SyncJobRunner {
    SyncJobRunner::new(store, registry(source), config)
}

/// Seed the target index with documents.
pub async fn seed_index(store: &dyn ConnectorStore, ids: &[&str]) {
    let operations: Vec<_> = ids
        .iter()
        .map(|id| BulkOperation::Index(Document::new(*id)))
        .collect();
    store.bulk(INDEX, &operations).await.expect("seed index");
}

/// Sorted ids currently in the target index.
pub async fn index_ids(store: &dyn ConnectorStore) -> Vec<String> {
    let mut ids: Vec<_> = store
        .fetch_document_ids(INDEX)
        .await
        .expect("fetch ids")
        .into_iter()
        .collect();
    ids.sort();
    ids
}

/// File-backed SQLite store with a connection pool, for concurrent access.
pub async fn file_sqlite_store(dir: &tempfile::TempDir) -> SqliteStore {
    SqliteStore::from_path(dir.path().join("connsync.db"))
        .await
        .expect("file sqlite")
}

/// File-less SQLite store with migrations applied.
pub async fn sqlite_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    connsync_core::migrations::run_sqlite(&pool)
        .await
        .expect("migrations");
    SqliteStore::new(pool)
}
