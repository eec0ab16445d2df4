// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run error budget.
//!
//! [`ErrorMonitor`] keeps a fixed-size ring of the most recent document
//! outcomes plus cumulative counters. Every recorded error is checked against
//! the consecutive, total and windowed limits; [`ErrorMonitor::finalize`]
//! checks the cumulative ratio over the whole run.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::warn;

use crate::error::{SyncError, abbreviate};

/// Error budget limits.
///
/// The windowed and cumulative ratios are configured separately.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Maximum errors over the whole run.
    pub max_errors: u64,
    /// Maximum errors in a row.
    pub max_consecutive_errors: u64,
    /// Number of recent outcomes in the window.
    pub window_size: usize,
    /// Maximum share of errors inside the window.
    pub max_error_ratio_in_window: f64,
    /// Maximum share of errors over the whole run, checked at finalize.
    pub max_error_ratio: f64,
    /// Number of recent errors kept for reporting.
    pub error_queue_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_errors: 1000,
            max_consecutive_errors: 10,
            window_size: 100,
            max_error_ratio_in_window: 0.15,
            max_error_ratio: 0.15,
            error_queue_size: 20,
        }
    }
}

impl MonitorConfig {
    /// Same ratio for the window and the whole run.
    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.max_error_ratio_in_window = ratio;
        self.max_error_ratio = ratio;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }
}

/// An error budget was exceeded.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum MonitorError {
    #[error(
        "Exceeded maximum consecutive errors - saw {count} errors in a row.{}",
        tripped_suffix(.tripped_by)
    )]
    ConsecutiveErrors {
        count: u64,
        tripped_by: Option<String>,
    },

    #[error(
        "Exceeded maximum number of errors - saw {count} errors in total.{}",
        tripped_suffix(.tripped_by)
    )]
    TotalErrors {
        count: u64,
        tripped_by: Option<String>,
    },

    #[error(
        "Exceeded maximum error ratio of {ratio}. Of the last {window} documents, {errors} had errors.{}",
        tripped_suffix(.tripped_by)
    )]
    WindowRatio {
        ratio: f64,
        window: usize,
        errors: usize,
        tripped_by: Option<String>,
    },

    #[error("There were {errors} errors out of {total} total documents")]
    CumulativeRatio { errors: u64, total: u64 },
}

fn tripped_suffix(tripped_by: &Option<String>) -> String {
    match tripped_by {
        Some(summary) => format!(" Tripped by - {}", summary),
        None => String::new(),
    }
}

/// A recorded document failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentError {
    pub error_class: &'static str,
    pub error_message: String,
    /// Document the error belongs to, when known.
    pub error_id: Option<String>,
}

/// Sliding-window and cumulative error budget for one run.
#[derive(Debug)]
pub struct ErrorMonitor {
    config: MonitorConfig,
    window: Vec<bool>,
    window_index: usize,
    total_error_count: u64,
    success_count: u64,
    consecutive_error_count: u64,
    error_queue: VecDeque<DocumentError>,
}

impl ErrorMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            window: vec![false; config.window_size],
            window_index: 0,
            total_error_count: 0,
            success_count: 0,
            consecutive_error_count: 0,
            error_queue: VecDeque::with_capacity(config.error_queue_size),
            config,
        }
    }

    pub fn note_success(&mut self) {
        self.consecutive_error_count = 0;
        self.success_count += 1;
        self.record_in_window(false);
    }

    /// Record a failed document and raise if a limit is exceeded.
    pub fn note_error(
        &mut self,
        error: &SyncError,
        document_id: Option<&str>,
    ) -> Result<(), MonitorError> {
        self.total_error_count += 1;
        self.consecutive_error_count += 1;
        self.record_in_window(true);

        if self.config.error_queue_size > 0 {
            if self.error_queue.len() >= self.config.error_queue_size {
                self.error_queue.pop_front();
            }
            self.error_queue.push_back(DocumentError {
                error_class: error.kind(),
                error_message: abbreviate(&error.to_string()),
                error_id: document_id.map(str::to_string),
            });
        }

        self.raise_if_necessary(error)
    }

    /// Check the cumulative ratio at the end of a run.
    pub fn finalize(&self) -> Result<(), MonitorError> {
        let total = self.total_error_count + self.success_count;
        if total == 0 {
            return Ok(());
        }

        let ratio = self.total_error_count as f64 / total as f64;
        if ratio > self.config.max_error_ratio {
            warn!(
                errors = self.total_error_count,
                total = total,
                "Cumulative error ratio exceeded"
            );
            return Err(MonitorError::CumulativeRatio {
                errors: self.total_error_count,
                total,
            });
        }
        Ok(())
    }

    pub fn error_count(&self) -> u64 {
        self.total_error_count
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    /// Most recent errors, oldest first.
    pub fn errors(&self) -> impl Iterator<Item = &DocumentError> {
        self.error_queue.iter()
    }

    fn errors_in_window(&self) -> usize {
        self.window.iter().filter(|&&failed| failed).count()
    }

    fn record_in_window(&mut self, failed: bool) {
        if self.window.is_empty() {
            return;
        }
        self.window[self.window_index] = failed;
        self.window_index = (self.window_index + 1) % self.window.len();
    }

    fn raise_if_necessary(&self, error: &SyncError) -> Result<(), MonitorError> {
        let tripped_by = Some(format!("{}: {}", error.kind(), error));

        if self.consecutive_error_count > self.config.max_consecutive_errors {
            return Err(MonitorError::ConsecutiveErrors {
                count: self.consecutive_error_count,
                tripped_by,
            });
        }

        if self.total_error_count > self.config.max_errors {
            return Err(MonitorError::TotalErrors {
                count: self.total_error_count,
                tripped_by,
            });
        }

        let window_size = self.window.len();
        if window_size > 0 {
            let errors = self.errors_in_window();
            if errors as f64 / window_size as f64 > self.config.max_error_ratio_in_window {
                return Err(MonitorError::WindowRatio {
                    ratio: self.config.max_error_ratio_in_window,
                    window: window_size,
                    errors,
                    tripped_by,
                });
            }
        }

        Ok(())
    }
}
