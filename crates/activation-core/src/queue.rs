//! Queue Transition
//!
//! Builds the atomic queue request for a fully resolved run and hands it to
//! the store, which sequences, marks `QUEUED`, persists bindings and
//! enqueues for dispatch in a single transaction.

use std::time::Duration;

use tracing::warn;

use crate::error::ActivationError;
use crate::ports::{ActivationStore, QueueCommit, QueueTransition, Result};
use crate::resolver::ResolutionReport;
use crate::types::Run;

/// Queue `run` with the bindings from `report`.
///
/// `report` must be complete; missing requirements produce no binding and
/// would be silently dropped.
pub async fn queue_run(
    store: &dyn ActivationStore,
    run: &Run,
    report: &ResolutionReport,
    timeout: Duration,
) -> Result<QueueCommit> {
    debug_assert!(report.is_complete(), "queue_run called with missing requirements");

    let transition = QueueTransition {
        run_id: run.id,
        job_id: run.job_id,
        bindings: report.bindings(),
        timeout,
    };

    match store.queue_run(&transition).await {
        Ok(commit) => Ok(commit),
        Err(e @ ActivationError::Timeout { .. }) => {
            warn!(
                run_id = %run.id,
                job_id = %run.job_id,
                error = %e,
                "Queue transition rolled back; run keeps its prior status"
            );
            Err(e)
        }
        Err(e) => Err(e),
    }
}
