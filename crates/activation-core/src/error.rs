use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors that abort an activation attempt.
///
/// None of these leave partial state behind: every variant is produced by a
/// read failure or a rolled-back transaction, so reissuing `activate` for the
/// same run is always safe. Runs that are absent or not activatable are not
/// errors; see `ActivationOutcome::Skipped`.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("queue transition for run {run_id} exceeded {timeout:?}")]
    Timeout { run_id: Uuid, timeout: Duration },

    #[error("run {run_id} references unknown job version {job_version_id}")]
    MissingJobVersion { run_id: Uuid, job_version_id: Uuid },

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

impl ActivationError {
    /// Whether the caller should reissue the activation later.
    ///
    /// Notification failures are never surfaced from `activate` (the missing
    /// connection row stays the source of truth), so they are not retried here.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Notification(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_timeout() {
        let e = ActivationError::Timeout {
            run_id: Uuid::nil(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(
            e.to_string(),
            "queue transition for run 00000000-0000-0000-0000-000000000000 exceeded 60s"
        );
    }

    #[test]
    fn display_store() {
        let e = ActivationError::Store(anyhow::anyhow!("connection reset"));
        assert_eq!(e.to_string(), "store: connection reset");
    }

    #[test]
    fn transaction_failures_are_retryable() {
        assert!(ActivationError::Timeout {
            run_id: Uuid::nil(),
            timeout: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(ActivationError::Store(anyhow::anyhow!("boom")).is_retryable());
        assert!(!ActivationError::Notification("down".into()).is_retryable());
    }
}
