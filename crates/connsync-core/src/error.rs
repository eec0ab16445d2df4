// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for connsync-core.
//!
//! Every error carries an [`ErrorClass`] that retry boundaries match on
//! explicitly: fatal errors end the run, transient ones may be retried at the
//! top level, and everything else counts against a bounded retry budget.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::connector::Cursors;
use crate::cron::CronError;
use crate::monitor::MonitorError;
use crate::status::JobStatus;

/// Result type using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Stored error messages are cut to this many characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 10_000;

/// Retry classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Never retried; ends the run with this error.
    Fatal,
    /// Network-level failure; the whole extraction attempt may be retried.
    Transient,
    /// Failure of a single document; isolated and counted by the monitor.
    PerDocument,
    /// Anything else; retried up to the attempt limit.
    Unclassified,
}

/// Kind of network failure reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused, reset or closed.
    Connection,
    /// TLS handshake or certificate failure.
    Tls,
    /// Request timed out.
    Timeout,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Errors raised by the sync engine and the sources it drives.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// Access token could not be refreshed.
    #[error("Could not refresh token: {0}")]
    TokenRefreshFailed(String),

    /// The job was interrupted from outside the run.
    #[error("Job was interrupted: {0}")]
    JobInterrupted(String),

    /// The source evicted the run; cursors mark how far it got.
    #[error("Sync was evicted: {message}")]
    Eviction {
        /// Reason given by the source.
        message: String,
        /// Cursor map at the time of eviction.
        cursors: Cursors,
    },

    /// The source is throttling requests.
    #[error("Throttled by the source, suspended until {suspend_until}")]
    Throttling {
        /// Earliest time the run may resume.
        suspend_until: DateTime<Utc>,
        /// Cursor map at the time of throttling.
        cursors: Cursors,
    },

    /// A network failure, wrapped with a resume hint and the cursor snapshot.
    #[error("Transient error, suspended until {suspend_until}: {message}")]
    TransientServer {
        /// The underlying failure.
        message: String,
        /// Earliest time the run should be retried.
        suspend_until: DateTime<Utc>,
        /// Cursor map at the time of failure.
        cursors: Cursors,
    },

    /// The run produced more documents than allowed.
    #[error("Document limit of {limit} exceeded")]
    DocumentLimitExceeded {
        /// Configured limit.
        limit: u64,
    },

    /// The error budget of the run was exceeded.
    #[error(transparent)]
    Monitoring(#[from] MonitorError),

    /// A stored secret was rejected by the source.
    #[error("Secret is invalid: {0}")]
    SecretInvalid(String),

    /// Index settings do not allow ingestion.
    #[error("Invalid indexing configuration: {0}")]
    InvalidIndexingConfiguration(String),

    /// Raw network failure from a source, before wrapping.
    #[error("Network error ({kind}): {message}")]
    Network {
        /// Failure kind.
        kind: NetworkErrorKind,
        /// Details.
        message: String,
    },

    /// A single document could not be extracted.
    #[error("Failed to extract document '{id}': {message}")]
    Document {
        /// Source identifier of the document.
        id: String,
        /// Details.
        message: String,
    },

    /// The source rejected a stored cursor.
    #[error("Cursor for partition '{partition}' is no longer valid")]
    InvalidCursor {
        /// Partition whose cursor was rejected.
        partition: String,
    },

    /// Stored configuration keys differ from the ones the source expects.
    #[error(
        "Connector of service_type '{service_type}' expected configurable fields: {expected}, actual stored fields: {actual}"
    )]
    IncompatibleConfigurableFields {
        /// Service type of the connector.
        service_type: String,
        /// Expected keys, sorted and comma separated.
        expected: String,
        /// Stored keys, sorted and comma separated.
        actual: String,
    },

    /// Connector record does not exist.
    #[error("Connector '{0}' not found")]
    ConnectorNotFound(String),

    /// Job record does not exist.
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// No source is registered for the service type.
    #[error("Service type '{0}' is not registered")]
    UnregisteredServiceType(String),

    /// The job state machine does not allow this move.
    #[error("Job '{job_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job identifier.
        job_id: String,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// A stored status string is outside its closed set.
    #[error("Unknown {kind} value '{value}'")]
    UnknownStatus {
        /// Which enum was being decoded.
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// Cron expression could not be converted or parsed.
    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    /// Storage operation failed.
    #[error("Store error during '{operation}': {details}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Source-specific failure without a finer classification.
    #[error("Source error: {0}")]
    Source(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Classification used by retry boundaries.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TokenRefreshFailed(_)
            | Self::JobInterrupted(_)
            | Self::Eviction { .. }
            | Self::Throttling { .. }
            | Self::DocumentLimitExceeded { .. }
            | Self::Monitoring(_)
            | Self::SecretInvalid(_)
            | Self::InvalidIndexingConfiguration(_) => ErrorClass::Fatal,
            Self::TransientServer { .. } | Self::Network { .. } => ErrorClass::Transient,
            Self::Document { .. } => ErrorClass::PerDocument,
            _ => ErrorClass::Unclassified,
        }
    }

    /// True for errors that must never be retried.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Short type name used in logs and monitor records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenRefreshFailed(_) => "TokenRefreshFailed",
            Self::JobInterrupted(_) => "JobInterrupted",
            Self::Eviction { .. } => "Eviction",
            Self::Throttling { .. } => "Throttling",
            Self::TransientServer { .. } => "TransientServer",
            Self::DocumentLimitExceeded { .. } => "DocumentLimitExceeded",
            Self::Monitoring(_) => "Monitoring",
            Self::SecretInvalid(_) => "SecretInvalid",
            Self::InvalidIndexingConfiguration(_) => "InvalidIndexingConfiguration",
            Self::Network { .. } => "Network",
            Self::Document { .. } => "Document",
            Self::InvalidCursor { .. } => "InvalidCursor",
            Self::IncompatibleConfigurableFields { .. } => "IncompatibleConfigurableFields",
            Self::ConnectorNotFound(_) => "ConnectorNotFound",
            Self::JobNotFound(_) => "JobNotFound",
            Self::UnregisteredServiceType(_) => "UnregisteredServiceType",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::UnknownStatus { .. } => "UnknownStatus",
            Self::Cron(_) => "Cron",
            Self::Store { .. } => "Store",
            Self::Source(_) => "Source",
            Self::Other(_) => "Other",
        }
    }

    /// Cursor snapshot carried by suspend-style errors.
    pub fn cursor_snapshot(&self) -> Option<&Cursors> {
        match self {
            Self::Eviction { cursors, .. }
            | Self::Throttling { cursors, .. }
            | Self::TransientServer { cursors, .. } => Some(cursors),
            _ => None,
        }
    }

    /// Build a helper for store failures.
    pub fn store(operation: &str, details: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::store("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SyncError::store("migrate", err)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::store("json", err)
    }
}

/// Cut a message to [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn abbreviate(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}
