// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use connsync_core::{MonitorConfig, RetryPolicy, RunnerConfig, SchedulerConfig};

use crate::job_cleanup::JobCleanupConfig;

/// connsync service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// SQLite connection URL
    pub database_url: String,
    /// Schedule every native connector, or one connector by id
    pub native_mode: bool,
    /// Connector served when not in native mode
    pub connector_id: Option<String>,
    /// Service type assumed for connectors that have none
    pub service_type: Option<String>,
    /// Hostname recorded on claimed jobs
    pub worker_hostname: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stuck_threshold: Duration,
    pub cleanup_interval: Duration,
    pub max_connection_attempts: u32,
    pub transient_retry_delay: Duration,
    /// Wait between attempts after a transient failure
    pub transient_backoff: Duration,
    /// Maximum concurrent sync runs
    pub max_workers: usize,
    pub index_prefix: String,
    pub monitor: MonitorConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CONNSYNC_DATABASE_URL`: SQLite connection string
    /// - `CONNSYNC_CONNECTOR_ID`: when `CONNSYNC_NATIVE_MODE` is false
    ///
    /// Optional (with defaults):
    /// - `CONNSYNC_NATIVE_MODE` (true)
    /// - `CONNSYNC_SERVICE_TYPE`
    /// - `CONNSYNC_WORKER_HOSTNAME` (falls back to `HOSTNAME`, then `localhost`)
    /// - `CONNSYNC_POLL_INTERVAL_SECS` (3)
    /// - `CONNSYNC_HEARTBEAT_INTERVAL_SECS` (1800)
    /// - `CONNSYNC_STUCK_THRESHOLD_SECS` (30)
    /// - `CONNSYNC_CLEANUP_INTERVAL_SECS` (60)
    /// - `CONNSYNC_MAX_CONNECTION_ATTEMPTS` (3)
    /// - `CONNSYNC_TRANSIENT_RETRY_DELAY_MINUTES` (5)
    /// - `CONNSYNC_TRANSIENT_BACKOFF_SECS` (1)
    /// - `CONNSYNC_MAX_WORKERS` (5)
    /// - `CONNSYNC_INDEX_PREFIX` (`search-`)
    /// - `CONNSYNC_MONITOR_*`: error budget, see [`MonitorConfig`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONNSYNC_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CONNSYNC_DATABASE_URL"))?;

        let native_mode = match std::env::var("CONNSYNC_NATIVE_MODE") {
            Ok(v) => parse_bool(&v)
                .ok_or(ConfigError::Invalid("CONNSYNC_NATIVE_MODE", "must be true or false"))?,
            Err(_) => true,
        };

        let connector_id = non_empty("CONNSYNC_CONNECTOR_ID");
        if !native_mode && connector_id.is_none() {
            return Err(ConfigError::Missing("CONNSYNC_CONNECTOR_ID"));
        }

        let worker_hostname = non_empty("CONNSYNC_WORKER_HOSTNAME")
            .or_else(|| non_empty("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());

        let max_workers: usize = parse_or("CONNSYNC_MAX_WORKERS", 5, "must be a positive integer")?;
        if max_workers == 0 {
            return Err(ConfigError::Invalid(
                "CONNSYNC_MAX_WORKERS",
                "must be a positive integer",
            ));
        }

        let max_connection_attempts: u32 = parse_or(
            "CONNSYNC_MAX_CONNECTION_ATTEMPTS",
            3,
            "must be a positive integer",
        )?;
        if max_connection_attempts == 0 {
            return Err(ConfigError::Invalid(
                "CONNSYNC_MAX_CONNECTION_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        let defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            max_errors: parse_or(
                "CONNSYNC_MONITOR_MAX_ERRORS",
                defaults.max_errors,
                "must be a non-negative integer",
            )?,
            max_consecutive_errors: parse_or(
                "CONNSYNC_MONITOR_MAX_CONSECUTIVE_ERRORS",
                defaults.max_consecutive_errors,
                "must be a non-negative integer",
            )?,
            window_size: parse_or(
                "CONNSYNC_MONITOR_WINDOW_SIZE",
                defaults.window_size,
                "must be a non-negative integer",
            )?,
            max_error_ratio_in_window: parse_ratio(
                "CONNSYNC_MONITOR_WINDOW_RATIO",
                defaults.max_error_ratio_in_window,
            )?,
            max_error_ratio: parse_ratio(
                "CONNSYNC_MONITOR_TOTAL_RATIO",
                defaults.max_error_ratio,
            )?,
            error_queue_size: parse_or(
                "CONNSYNC_MONITOR_ERROR_QUEUE_SIZE",
                defaults.error_queue_size,
                "must be a non-negative integer",
            )?,
        };

        Ok(Self {
            database_url,
            native_mode,
            connector_id,
            service_type: non_empty("CONNSYNC_SERVICE_TYPE"),
            worker_hostname,
            poll_interval: secs("CONNSYNC_POLL_INTERVAL_SECS", 3)?,
            heartbeat_interval: secs("CONNSYNC_HEARTBEAT_INTERVAL_SECS", 1800)?,
            stuck_threshold: secs("CONNSYNC_STUCK_THRESHOLD_SECS", 30)?,
            cleanup_interval: secs("CONNSYNC_CLEANUP_INTERVAL_SECS", 60)?,
            max_connection_attempts,
            transient_retry_delay: Duration::from_secs(
                60 * parse_or::<u64>(
                    "CONNSYNC_TRANSIENT_RETRY_DELAY_MINUTES",
                    5,
                    "must be a number of minutes",
                )?,
            ),
            transient_backoff: secs("CONNSYNC_TRANSIENT_BACKOFF_SECS", 1)?,
            max_workers,
            index_prefix: std::env::var("CONNSYNC_INDEX_PREFIX")
                .unwrap_or_else(|_| "search-".to_string()),
            monitor,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            index_prefix: self.index_prefix.clone(),
            default_service_type: self.service_type.clone(),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            worker_hostname: self.worker_hostname.clone(),
            monitor: self.monitor.clone(),
            retry: RetryPolicy {
                max_attempts: self.max_connection_attempts,
                transient_retry_delay: self.transient_retry_delay,
                transient_backoff: self.transient_backoff,
            },
            // several touches per stuck threshold
            job_heartbeat_interval: self.stuck_threshold / 3,
            ..Default::default()
        }
    }

    pub fn cleanup_config(&self) -> JobCleanupConfig {
        JobCleanupConfig {
            poll_interval: self.cleanup_interval,
            stuck_threshold: self.stuck_threshold,
            connector_id: if self.native_mode {
                None
            } else {
                self.connector_id.clone()
            },
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or(key, default, "must be a number of seconds").map(Duration::from_secs)
}

fn parse_ratio(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    let ratio: f64 = parse_or(key, default, "must be a ratio between 0 and 1")?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(ConfigError::Invalid(key, "must be a ratio between 0 and 1"))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
