// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Classified retries around the top-level extraction calls.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use super::{Emitter, Extractor};
use crate::connector::Cursors;
use crate::error::{ErrorClass, Result, SyncError};

/// Retry limits for extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per top-level call, including the first.
    pub max_attempts: u32,
    /// How far in the future a transient failure asks to resume.
    pub transient_retry_delay: Duration,
    /// Wait before retrying after a transient failure.
    pub transient_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            transient_retry_delay: Duration::from_secs(5 * 60),
            transient_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run a full extraction, re-invoking it on retryable failures.
    pub async fn extract(&self, extractor: &dyn Extractor, emitter: &mut Emitter) -> Result<()> {
        let mut attempts = 0;
        loop {
            match extractor.extract(emitter).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let e = self.convert_transient(e, emitter.cursors());
                    let backoff = self.backoff_for(&e);
                    self.check_retry(&mut attempts, e, "extraction")?;
                    wait(backoff).await;
                }
            }
        }
    }

    /// Ask the source which of `ids` are gone, with the same retry rules.
    pub async fn deleted_ids(
        &self,
        extractor: &dyn Extractor,
        ids: &[String],
        cursors: &Cursors,
    ) -> Result<Vec<String>> {
        let mut attempts = 0;
        loop {
            match extractor.deleted_ids(ids).await {
                Ok(deleted) => return Ok(deleted),
                Err(e) => {
                    let e = self.convert_transient(e, cursors);
                    let backoff = self.backoff_for(&e);
                    self.check_retry(&mut attempts, e, "deleted ids")?;
                    wait(backoff).await;
                }
            }
        }
    }

    /// Wrap raw network failures with a resume hint and cursor snapshot.
    pub fn convert_transient(&self, error: SyncError, cursors: &Cursors) -> SyncError {
        match error {
            SyncError::Network { kind, message } => {
                let now = Utc::now();
                let delay = chrono::Duration::from_std(self.transient_retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                SyncError::TransientServer {
                    message: format!("{} failure: {}", kind, message),
                    suspend_until: now.checked_add_signed(delay).unwrap_or(now),
                    cursors: cursors.clone(),
                }
            }
            other => other,
        }
    }

    fn backoff_for(&self, error: &SyncError) -> Duration {
        match error.class() {
            ErrorClass::Transient => self.transient_backoff,
            _ => Duration::ZERO,
        }
    }

    /// `Ok` means try again; `Err` carries the error to surface.
    fn check_retry(&self, attempts: &mut u32, error: SyncError, operation: &str) -> Result<()> {
        match error.class() {
            ErrorClass::Fatal => {
                if matches!(error, SyncError::TokenRefreshFailed(_)) {
                    error!(operation = operation, error = %error, "Could not refresh token, aborting");
                } else {
                    warn!(operation = operation, error = %error, "Fatal error during {}, not retrying", operation);
                }
                Err(error)
            }
            ErrorClass::Transient | ErrorClass::PerDocument | ErrorClass::Unclassified => {
                *attempts += 1;
                if *attempts >= self.max_attempts {
                    warn!(
                        operation = operation,
                        error = %error,
                        "Retries: {}/{}, giving up.",
                        attempts,
                        self.max_attempts
                    );
                    Err(error)
                } else {
                    warn!(
                        operation = operation,
                        error = %error,
                        "Retries: {}/{}, trying again.",
                        attempts,
                        self.max_attempts
                    );
                    Ok(())
                }
            }
        }
    }
}

async fn wait(backoff: Duration) {
    if !backoff.is_zero() {
        debug!(backoff_ms = backoff.as_millis() as u64, "Waiting before the next attempt");
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkErrorKind;
    use crate::extractor::{Document, DocumentChange};
    use crate::monitor::{ErrorMonitor, MonitorConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Fails the first `failures` calls with the error built by `make_error`.
    struct FlakyExtractor {
        calls: AtomicU32,
        failures: u32,
        make_error: fn() -> SyncError,
    }

    impl FlakyExtractor {
        fn new(failures: u32, make_error: fn() -> SyncError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                make_error,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for FlakyExtractor {
        async fn extract(&self, emitter: &mut Emitter) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.make_error)());
            }
            emitter
                .emit("a", Ok(DocumentChange::upsert(Document::new("a"))))
                .await
        }

        async fn deleted_ids(&self, ids: &[String]) -> Result<Vec<String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.make_error)());
            }
            Ok(ids.to_vec())
        }
    }

    fn emitter() -> (Emitter, mpsc::Receiver<DocumentChange>) {
        let (tx, rx) = mpsc::channel(8);
        let mut cursors = Cursors::new();
        cursors.insert("drive-1".into(), "token-1".into());
        (
            Emitter::new(tx, ErrorMonitor::new(MonitorConfig::default()), cursors, None),
            rx,
        )
    }

    #[tokio::test]
    async fn test_unclassified_errors_are_retried() {
        let extractor = FlakyExtractor::new(2, || SyncError::Source("HTTP 500".into()));
        let (mut emitter, mut rx) = emitter();

        RetryPolicy::default()
            .extract(&extractor, &mut emitter)
            .await
            .unwrap();

        assert_eq!(extractor.calls(), 3);
        assert_eq!(rx.recv().await.unwrap().document.id, "a");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let extractor = FlakyExtractor::new(5, || SyncError::Source("HTTP 500".into()));
        let (mut emitter, _rx) = emitter();

        let err = RetryPolicy::default()
            .extract(&extractor, &mut emitter)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Source(_)));
        assert_eq!(extractor.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let extractor = FlakyExtractor::new(1, || SyncError::TokenRefreshFailed("revoked".into()));
        let (mut emitter, _rx) = emitter();

        let err = RetryPolicy::default()
            .extract(&extractor, &mut emitter)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::TokenRefreshFailed(_)));
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_surface_as_transient() {
        let extractor = FlakyExtractor::new(3, || SyncError::Network {
            kind: NetworkErrorKind::Connection,
            message: "connection reset by peer".into(),
        });
        let (mut emitter, _rx) = emitter();
        let before = Utc::now();

        let err = RetryPolicy::default()
            .extract(&extractor, &mut emitter)
            .await
            .unwrap_err();

        match err {
            SyncError::TransientServer {
                suspend_until,
                cursors,
                message,
            } => {
                assert!(suspend_until >= before + chrono::Duration::minutes(5));
                assert_eq!(cursors.get("drive-1").map(String::as_str), Some("token-1"));
                assert!(message.contains("connection reset by peer"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(extractor.calls(), 3);
    }

    #[tokio::test]
    async fn test_deleted_ids_uses_same_classification() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let ids = vec!["a".to_string(), "b".to_string()];

        let extractor = FlakyExtractor::new(1, || SyncError::Source("flaky".into()));
        let deleted = policy
            .deleted_ids(&extractor, &ids, &Cursors::new())
            .await
            .unwrap();
        assert_eq!(deleted, ids);

        let extractor = FlakyExtractor::new(1, || SyncError::SecretInvalid("rotated".into()));
        assert!(policy
            .deleted_ids(&extractor, &ids, &Cursors::new())
            .await
            .is_err());
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off() {
        let extractor = FlakyExtractor::new(2, || SyncError::Network {
            kind: NetworkErrorKind::Timeout,
            message: "read timed out".into(),
        });
        let (mut emitter, _rx) = emitter();
        let policy = RetryPolicy {
            transient_backoff: Duration::from_secs(30),
            ..Default::default()
        };
        let started = tokio::time::Instant::now();

        policy.extract(&extractor, &mut emitter).await.unwrap();

        assert_eq!(extractor.calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_failures_retry_immediately() {
        let extractor = FlakyExtractor::new(2, || SyncError::Source("HTTP 500".into()));
        let (mut emitter, _rx) = emitter();
        let started = tokio::time::Instant::now();

        RetryPolicy::default()
            .extract(&extractor, &mut emitter)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
