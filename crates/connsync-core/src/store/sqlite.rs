// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Structured connector fields (scheduling, configuration, cursors, filtering)
//! are stored as JSON text. Job writes are conditioned in SQL on the version
//! token pair so concurrent workers sharing one database file observe
//! conflicts rather than overwriting each other.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{BulkOperation, ConnectorStore};
use crate::connector::{ConnectorConfiguration, ConnectorUpdate};
use crate::error::{Result, SyncError};
use crate::extractor::Document;
use crate::job::{Completion, ConnectorSnapshot, JobUpdate, SyncJob, VersionToken, WriteOutcome};
use crate::migrations;
use crate::status::JobStatus;

const CONNECTOR_COLUMNS: &str = "id, service_type, index_name, status, is_native, sync_now, \
    scheduling, last_synced, last_seen, last_sync_status, last_sync_error, \
    last_indexed_document_count, last_deleted_document_count, error, configuration, cursors, \
    filtering, pipeline";

const JOB_COLUMNS: &str = "id, connector, status, created_at, started_at, last_seen, \
    completed_at, canceled_at, error, indexed_document_count, deleted_document_count, \
    total_document_count, indexed_document_volume, worker_hostname, seq_no, primary_term";

const TERMINAL_STATUSES: &str = "('completed', 'error', 'failed', 'canceled')";

#[derive(Debug, sqlx::FromRow)]
struct ConnectorRow {
    id: String,
    service_type: Option<String>,
    index_name: String,
    status: String,
    is_native: bool,
    sync_now: bool,
    scheduling: Option<String>,
    last_synced: Option<DateTime<Utc>>,
    last_seen: Option<String>,
    last_sync_status: Option<String>,
    last_sync_error: Option<String>,
    last_indexed_document_count: Option<i64>,
    last_deleted_document_count: Option<i64>,
    error: Option<String>,
    configuration: String,
    cursors: String,
    filtering: Option<String>,
    pipeline: Option<String>,
}

impl TryFrom<ConnectorRow> for ConnectorConfiguration {
    type Error = SyncError;

    fn try_from(row: ConnectorRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            service_type: row.service_type,
            index_name: row.index_name,
            status: row.status.parse()?,
            is_native: row.is_native,
            sync_now: row.sync_now,
            scheduling: from_json_opt(row.scheduling.as_deref())?,
            last_synced: row.last_synced,
            last_seen: row.last_seen,
            last_sync_status: row
                .last_sync_status
                .as_deref()
                .map(str::parse)
                .transpose()?,
            last_sync_error: row.last_sync_error,
            last_indexed_document_count: row.last_indexed_document_count.map(to_u64),
            last_deleted_document_count: row.last_deleted_document_count.map(to_u64),
            error: row.error,
            configuration: serde_json::from_str(&row.configuration)?,
            cursors: serde_json::from_str(&row.cursors)?,
            filtering: from_json_opt(row.filtering.as_deref())?,
            pipeline: from_json_opt(row.pipeline.as_deref())?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    connector: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    error: Option<String>,
    indexed_document_count: i64,
    deleted_document_count: i64,
    total_document_count: i64,
    indexed_document_volume: i64,
    worker_hostname: Option<String>,
    seq_no: i64,
    primary_term: i64,
}

impl TryFrom<JobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            connector: serde_json::from_str(&row.connector)?,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            last_seen: row.last_seen,
            completed_at: row.completed_at,
            canceled_at: row.canceled_at,
            error: row.error,
            indexed_document_count: to_u64(row.indexed_document_count),
            deleted_document_count: to_u64(row.deleted_document_count),
            total_document_count: to_u64(row.total_document_count),
            indexed_document_volume: to_u64(row.indexed_document_volume),
            worker_hostname: row.worker_hostname,
            version: VersionToken {
                seq_no: row.seq_no,
                primary_term: row.primary_term,
            },
        })
    }
}

fn from_json_opt<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>> {
    raw.map(serde_json::from_str).transpose().map_err(Into::into)
}

fn to_json_opt<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// SQLite-backed [`ConnectorStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/connsync.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::store(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| {
                SyncError::store("connect", format!("Failed to connect to {}: {}", url, e))
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored body of one document.
    pub async fn get_document(&self, index_name: &str, id: &str) -> Result<Option<Document>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE index_name = ? AND id = ?")
                .bind(index_name)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    async fn fetch_connector(
        conn: &mut SqliteConnection,
        connector_id: &str,
    ) -> Result<Option<ConnectorConfiguration>> {
        let sql = format!("SELECT {} FROM connectors WHERE id = ?", CONNECTOR_COLUMNS);
        sqlx::query_as::<_, ConnectorRow>(&sql)
            .bind(connector_id)
            .fetch_optional(conn)
            .await?
            .map(ConnectorConfiguration::try_from)
            .transpose()
    }

    async fn write_connector(
        conn: &mut SqliteConnection,
        connector: &ConnectorConfiguration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO connectors (
                id, service_type, index_name, status, is_native, sync_now, scheduling,
                last_synced, last_seen, last_sync_status, last_sync_error,
                last_indexed_document_count, last_deleted_document_count, error,
                configuration, cursors, filtering, pipeline
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
        )
        .bind(&connector.id)
        .bind(&connector.service_type)
        .bind(&connector.index_name)
        .bind(connector.status.as_str())
        .bind(connector.is_native)
        .bind(connector.sync_now)
        .bind(to_json_opt(connector.scheduling.as_ref())?)
        .bind(connector.last_synced)
        .bind(&connector.last_seen)
        .bind(connector.last_sync_status.map(|s| s.as_str()))
        .bind(&connector.last_sync_error)
        .bind(connector.last_indexed_document_count.map(to_i64))
        .bind(connector.last_deleted_document_count.map(to_i64))
        .bind(&connector.error)
        .bind(serde_json::to_string(&connector.configuration)?)
        .bind(serde_json::to_string(&connector.cursors)?)
        .bind(to_json_opt(connector.filtering.as_ref())?)
        .bind(to_json_opt(connector.pipeline.as_ref())?)
        .execute(conn)
        .await?;

        Ok(())
    }

    async fn job_exists(conn: &mut SqliteConnection, job_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(conn)
            .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl ConnectorStore for SqliteStore {
    async fn put_connector(&self, connector: &ConnectorConfiguration) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::write_connector(&mut conn, connector).await
    }

    async fn get_connector(&self, connector_id: &str) -> Result<Option<ConnectorConfiguration>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_connector(&mut conn, connector_id).await
    }

    async fn list_connectors(&self, native_only: bool) -> Result<Vec<ConnectorConfiguration>> {
        let sql = format!(
            "SELECT {} FROM connectors WHERE (?1 = 0 OR is_native = 1) ORDER BY id",
            CONNECTOR_COLUMNS
        );
        sqlx::query_as::<_, ConnectorRow>(&sql)
            .bind(native_only)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ConnectorConfiguration::try_from)
            .collect()
    }

    async fn delete_connector(&self, connector_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connectors WHERE id = ?1")
            .bind(connector_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_connector_fields(
        &self,
        connector_id: &str,
        update: &ConnectorUpdate,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // take the write lock before reading
        let locked = sqlx::query("UPDATE connectors SET id = id WHERE id = ?1")
            .bind(connector_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        if !locked {
            return Err(SyncError::ConnectorNotFound(connector_id.to_string()));
        }

        let mut connector = Self::fetch_connector(&mut tx, connector_id)
            .await?
            .ok_or_else(|| SyncError::ConnectorNotFound(connector_id.to_string()))?;
        update.apply(&mut connector);
        Self::write_connector(&mut tx, &connector).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_job(&self, connector_id: &str, worker_hostname: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE connectors
            SET sync_now = 0, last_sync_status = 'in_progress', last_synced = ?1
            WHERE id = ?2
              AND (last_sync_status IS NULL OR last_sync_status <> 'in_progress')
            "#,
        )
        .bind(now)
        .bind(connector_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let Some(connector) = Self::fetch_connector(&mut tx, connector_id).await? else {
            return Err(SyncError::ConnectorNotFound(connector_id.to_string()));
        };
        if !claimed {
            return Ok(None);
        }

        let job_id = Uuid::new_v4().to_string();
        let snapshot = serde_json::to_string(&ConnectorSnapshot::of(&connector))?;

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, connector_id, connector, status, created_at, started_at, last_seen,
                worker_hostname, seq_no, primary_term
            )
            VALUES (?1, ?2, ?3, 'in_progress', ?4, ?4, ?4, ?5, 0, 1)
            "#,
        )
        .bind(&job_id)
        .bind(connector_id)
        .bind(snapshot)
        .bind(now)
        .bind(worker_hostname)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job_id))
    }

    async fn complete_sync(
        &self,
        connector_id: &str,
        job_id: &str,
        expected: VersionToken,
        completion: &Completion,
    ) -> Result<WriteOutcome<VersionToken>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE sync_jobs
            SET status = ?1, error = ?2, last_seen = ?3, completed_at = ?3, canceled_at = ?4,
                indexed_document_count = ?5, deleted_document_count = ?6,
                indexed_document_volume = ?7, total_document_count = ?8,
                seq_no = seq_no + 1
            WHERE id = ?9 AND seq_no = ?10 AND primary_term = ?11
              AND status NOT IN {}
            "#,
            TERMINAL_STATUSES
        );
        let applied = sqlx::query(&sql)
            .bind(completion.status.as_str())
            .bind(&completion.error)
            .bind(completion.completed_at)
            .bind(completion.canceled_at)
            .bind(to_i64(completion.stats.indexed_document_count))
            .bind(to_i64(completion.stats.deleted_document_count))
            .bind(to_i64(completion.stats.indexed_document_volume))
            .bind(to_i64(completion.total_document_count))
            .bind(job_id)
            .bind(expected.seq_no)
            .bind(expected.primary_term)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if !applied {
            if Self::job_exists(&mut tx, job_id).await? {
                return Ok(WriteOutcome::Conflict);
            }
            return Err(SyncError::JobNotFound(job_id.to_string()));
        }

        let cursors = completion
            .cursors
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let updated = sqlx::query(
            r#"
            UPDATE connectors
            SET last_sync_status = ?1, last_sync_error = ?2, last_synced = ?3,
                last_indexed_document_count = ?4, last_deleted_document_count = ?5,
                cursors = COALESCE(?6, cursors)
            WHERE id = ?7
            "#,
        )
        .bind(completion.status.as_str())
        .bind(&completion.error)
        .bind(completion.completed_at)
        .bind(to_i64(completion.stats.indexed_document_count))
        .bind(to_i64(completion.stats.deleted_document_count))
        .bind(cursors)
        .bind(connector_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(SyncError::ConnectorNotFound(connector_id.to_string()));
        }

        tx.commit().await?;
        Ok(WriteOutcome::Applied(expected.next()))
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let sql = format!("SELECT {} FROM sync_jobs WHERE id = ?", JOB_COLUMNS);
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(SyncJob::try_from)
            .transpose()
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<SyncJob>> {
        let sql = format!(
            "SELECT {} FROM sync_jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, id",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SyncJob::try_from)
            .collect()
    }

    async fn update_job_if_version(
        &self,
        job_id: &str,
        expected: VersionToken,
        update: &JobUpdate,
    ) -> Result<WriteOutcome<VersionToken>> {
        let mut conn = self.pool.acquire().await?;

        let sql = format!(
            r#"
            UPDATE sync_jobs
            SET status = COALESCE(?1, status),
                last_seen = COALESCE(?2, last_seen),
                error = CASE WHEN ?3 THEN ?4 ELSE error END,
                seq_no = seq_no + 1
            WHERE id = ?5 AND seq_no = ?6 AND primary_term = ?7
              AND status NOT IN {}
            "#,
            TERMINAL_STATUSES
        );
        let applied = sqlx::query(&sql)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.last_seen)
            .bind(update.error.is_some())
            .bind(update.error.clone().flatten())
            .bind(job_id)
            .bind(expected.seq_no)
            .bind(expected.primary_term)
            .execute(&mut *conn)
            .await?
            .rows_affected()
            > 0;

        if applied {
            Ok(WriteOutcome::Applied(expected.next()))
        } else if Self::job_exists(&mut conn, job_id).await? {
            Ok(WriteOutcome::Conflict)
        } else {
            Err(SyncError::JobNotFound(job_id.to_string()))
        }
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for job_id in job_ids {
            deleted += sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
                .bind(job_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn bulk(&self, index_name: &str, operations: &[BulkOperation]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for operation in operations {
            match operation {
                BulkOperation::Index(document) => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (index_name, id, body, updated_at)
                        VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT(index_name, id)
                        DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(index_name)
                    .bind(&document.id)
                    .bind(serde_json::to_string(document)?)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                BulkOperation::Delete(id) => {
                    sqlx::query("DELETE FROM documents WHERE index_name = ? AND id = ?")
                        .bind(index_name)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn document_ids_page(
        &self,
        index_name: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM documents
            WHERE index_name = ?1 AND (?2 IS NULL OR id > ?2)
            ORDER BY id
            LIMIT ?3
            "#,
        )
        .bind(index_name)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn document_count(&self, index_name: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE index_name = ?")
            .bind(index_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }
}
