// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! connsync Core - Connector Sync Orchestration
//!
//! This crate decides when each registered connector should sync, claims a
//! job for it atomically, runs a resilient extraction against the source and
//! reconciles the target index with what the source produced.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     connsync-service (dispatcher)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           ▲ (connector, task) events                │ spawns tasks
//!           │                                         ▼
//! ┌───────────────────────┐      ┌──────────────────────────────────────────┐
//! │      Scheduler        │      │ SyncJobRunner / heartbeat / bootstrap /   │
//! │  sync, heartbeat,     │      │ filter validation                         │
//! │  configuration,       │      │                                           │
//! │  filter validation    │      │  claim ─► extract ─► reconcile ─► finish  │
//! └───────────────────────┘      └──────────────────────────────────────────┘
//!           │                                  │                 │
//!           ▼                                  ▼                 ▼
//! ┌─────────────────────────────────────────────────┐  ┌──────────────────┐
//! │         ConnectorStore (SQLite / memory)         │  │ SourceConnector  │
//! │   connectors, sync_jobs, target indices          │  │  (registry)      │
//! └─────────────────────────────────────────────────┘  └──────────────────┘
//! ```
//!
//! # Job Status State Machine
//!
//! ```text
//!                claim
//!   (none) ──────────────► in_progress ──┬──► completed
//!                              │         ├──► failed
//!                              │         ├──► error
//!                              ▼         │
//!                          canceling ────┴──► canceled
//! ```
//!
//! Terminal statuses are never left. Every job write is conditioned on the
//! version pair read before it; a stale writer gets [`WriteOutcome::Conflict`]
//! and must drop its update.
//!
//! # Extraction
//!
//! An [`Extractor`] pushes [`DocumentChange`]s through an [`Emitter`] into a
//! bounded channel. Per-document failures are fed to the [`ErrorMonitor`],
//! which aborts the run once its error budget is spent. Transient failures
//! retry the whole attempt up to [`RetryPolicy::max_attempts`].
//!
//! # Modules
//!
//! - [`scheduler`] - per-connector triggers and the polling loop
//! - [`runner`] - one sync run from claim to terminal write
//! - [`job`] - job records and the conditional write protocol
//! - [`store`] - persistence trait with SQLite and in-memory backends
//! - [`sink`] - index, console and fan-out outputs
//! - [`cron`] - quartz schedule conversion

pub mod configuration;
pub mod connector;
pub mod cron;
pub mod error;
pub mod extractor;
pub mod filtering;
pub mod heartbeat;
pub mod job;
pub mod migrations;
pub mod monitor;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod status;
pub mod store;

pub use connector::{ConnectorConfiguration, ConnectorUpdate, Cursors};
pub use error::{ErrorClass, Result, SyncError};
pub use extractor::retry::RetryPolicy;
pub use extractor::{Document, DocumentChange, Emitter, Extractor};
pub use job::{IngestionStats, SyncJob, VersionToken, WriteOutcome};
pub use monitor::{ErrorMonitor, MonitorConfig, MonitorError};
pub use registry::{ConnectorRegistry, SourceConnector};
pub use runner::{RunnerConfig, SyncJobRunner, SyncOutcome, SyncReport};
pub use scheduler::{
    ConnectorProvider, NativeConnectors, Scheduler, SchedulerConfig, SingleConnector, TaskKind,
};
pub use sink::{CombinedSink, ConsoleSink, IndexSink, OutputSink};
pub use status::{ConnectorStatus, JobStatus, ValidationState};
pub use store::{ConnectorStore, MemoryStore, SqliteStore};
