// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Closed status enums for connectors, jobs and filter validation.
//!
//! Values are stored as snake_case strings. Decoding an unknown value is an
//! error, never a fallback.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Lifecycle status of a connector.
///
/// ```text
/// created ──► needs_configuration ──► configured ──► connected ◄──► error
///    └──────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    /// Registered, configuration not yet bootstrapped.
    Created,
    /// Bootstrapped, but some configurable fields have no value.
    NeedsConfiguration,
    /// All configurable fields have values.
    Configured,
    /// Last health check passed.
    Connected,
    /// Last health check or sync failed.
    Error,
}

impl ConnectorStatus {
    /// Statuses in which a sync may be scheduled.
    pub const ALLOWING_SYNC: [ConnectorStatus; 3] = [
        ConnectorStatus::Configured,
        ConnectorStatus::Connected,
        ConnectorStatus::Error,
    ];

    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::NeedsConfiguration => "needs_configuration",
            Self::Configured => "configured",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Whether scheduling may trigger a run in this status.
    pub fn allows_sync(&self) -> bool {
        Self::ALLOWING_SYNC.contains(self)
    }
}

impl FromStr for ConnectorStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "needs_configuration" => Ok(Self::NeedsConfiguration),
            "configured" => Ok(Self::Configured),
            "connected" => Ok(Self::Connected),
            "error" => Ok(Self::Error),
            other => Err(SyncError::UnknownStatus {
                kind: "connector status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a sync job.
///
/// ```text
/// pending ──► in_progress ──► completed | error | failed | canceled
///                 │  ▲
///                 ▼  │
///              suspended      canceling ──► canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Failed,
    Canceled,
    Canceling,
    Suspended,
}

impl JobStatus {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Canceling => "canceling",
            Self::Suspended => "suspended",
        }
    }

    /// Terminal statuses never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Failed | Self::Canceled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, InProgress | Canceling | Canceled),
            InProgress => matches!(
                next,
                InProgress | Completed | Error | Failed | Canceled | Canceling | Suspended
            ),
            Canceling => matches!(next, Canceled | Error | Failed),
            Suspended => matches!(next, InProgress | Canceling | Canceled | Error),
            Completed | Error | Failed | Canceled => false,
        }
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "canceling" => Ok(Self::Canceling),
            "suspended" => Ok(Self::Suspended),
            other => Err(SyncError::UnknownStatus {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation state of a filter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Invalid,
    Valid,
    /// Modified by a user and waiting for validation.
    Edited,
}

impl ValidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Valid => "valid",
            Self::Edited => "edited",
        }
    }
}

impl FromStr for ValidationState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid" => Ok(Self::Invalid),
            "valid" => Ok(Self::Valid),
            "edited" => Ok(Self::Edited),
            other => Err(SyncError::UnknownStatus {
                kind: "validation state",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_status_allows_sync() {
        assert!(!ConnectorStatus::Created.allows_sync());
        assert!(!ConnectorStatus::NeedsConfiguration.allows_sync());
        assert!(ConnectorStatus::Configured.allows_sync());
        assert!(ConnectorStatus::Connected.allows_sync());
        assert!(ConnectorStatus::Error.allows_sync());
    }

    #[test]
    fn test_unknown_values_are_rejected() {
        let err = "paused".parse::<JobStatus>().unwrap_err();
        assert!(matches!(
            err,
            SyncError::UnknownStatus {
                kind: "job status",
                ..
            }
        ));
        assert!("CONNECTED".parse::<ConnectorStatus>().is_err());
        assert!("".parse::<ValidationState>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&ConnectorStatus::NeedsConfiguration).unwrap();
        assert_eq!(json, "\"needs_configuration\"");

        let status: JobStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(status, JobStatus::InProgress);
        assert!(serde_json::from_str::<JobStatus>("\"running\"").is_err());
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let all = [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Error,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Canceling,
            JobStatus::Suspended,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_job_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Canceling.can_transition_to(JobStatus::Canceled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Canceling.can_transition_to(JobStatus::InProgress));
    }
}
