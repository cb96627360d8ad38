//! Activation Gate
//!
//! `ActivationService::activate()` is the sole entry point for moving a run
//! out of `PENDING`. It resolves connections and branches:
//!
//! ```text
//! PENDING ──┬── all resolved ──► QUEUED (sequence number, bindings, dispatch)
//!           └── any missing ───► WAITING_ON_CONNECTIONS (missing connections linked)
//! WAITING_ON_CONNECTIONS ── same rule, repeatable until QUEUED
//! ```
//!
//! Runs in any other status, or absent runs, are skipped without error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ActivationError;
use crate::ports::{ActivationStore, ProvisioningNotifier, QueueCommit, Result};
use crate::queue::queue_run;
use crate::resolver::resolve_connections;
use crate::tracker::{track_missing_connections, TrackOutcome};
use crate::types::*;

/// Default ceiling on the queue transaction, sized to let the job sequence
/// lock queue behind concurrent activations of the same job.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunables for the activation pipeline.
#[derive(Debug, Clone)]
pub struct ActivationConfig {
    pub queue_timeout: Duration,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// ActivationOutcome
// ---------------------------------------------------------------------------

/// Why an activation attempt did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    RunNotFound,
    NotActivatable { status: RunStatus },
}

/// What one call to `activate` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActivationOutcome {
    Skipped {
        run_id: Uuid,
        reason: SkipReason,
    },
    Queued {
        run_id: Uuid,
        sequence_number: i64,
        bindings: usize,
    },
    WaitingOnConnections {
        run_id: Uuid,
        missing: Vec<MissingConnectionKey>,
        notified: Vec<Uuid>,
    },
}

impl ActivationOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Skipped { run_id, .. }
            | Self::Queued { run_id, .. }
            | Self::WaitingOnConnections { run_id, .. } => *run_id,
        }
    }
}

// ---------------------------------------------------------------------------
// ActivationService
// ---------------------------------------------------------------------------

/// Runs the activation pipeline against a store and a provisioning notifier.
///
/// Holds no mutable state of its own; every cross-run guarantee comes from
/// the store's transactions, so one service may be shared by any number of
/// concurrent callers.
pub struct ActivationService {
    store: Arc<dyn ActivationStore>,
    notifier: Arc<dyn ProvisioningNotifier>,
    config: ActivationConfig,
}

impl ActivationService {
    pub fn new(store: Arc<dyn ActivationStore>, notifier: Arc<dyn ProvisioningNotifier>) -> Self {
        Self {
            store,
            notifier,
            config: ActivationConfig::default(),
        }
    }

    /// Override the default configuration (builder pattern).
    pub fn with_config(mut self, config: ActivationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ActivationStore> {
        &self.store
    }

    /// Activate one run.
    ///
    /// Safe to call any number of times for the same run: once the run has
    /// left `PENDING`/`WAITING_ON_CONNECTIONS` every further call is skipped.
    /// Errors are transaction aborts with no partial state; retry by calling
    /// again.
    pub async fn activate(&self, run_id: Uuid) -> Result<ActivationOutcome> {
        let Some(run) = self.store.load_run(run_id).await? else {
            debug!(run_id = %run_id, "Run not found; skipping activation");
            return Ok(ActivationOutcome::Skipped {
                run_id,
                reason: SkipReason::RunNotFound,
            });
        };

        if !run.status.is_activatable() {
            debug!(run_id = %run_id, status = %run.status, "Run not activatable; skipping");
            return Ok(skipped(run_id, run.status));
        }

        let job_version = self
            .store
            .load_job_version(run.job_version_id)
            .await?
            .ok_or(ActivationError::MissingJobVersion {
                run_id,
                job_version_id: run.job_version_id,
            })?;

        let report = resolve_connections(self.store.as_ref(), &run, &job_version).await?;

        if report.is_complete() {
            match queue_run(self.store.as_ref(), &run, &report, self.config.queue_timeout).await? {
                QueueCommit::Queued(queued) => {
                    let sequence_number = queued.sequence_number.ok_or_else(|| {
                        ActivationError::Store(anyhow!(
                            "store queued run {run_id} without a sequence number"
                        ))
                    })?;
                    info!(
                        run_id = %run_id,
                        job_id = %run.job_id,
                        sequence_number,
                        "Run queued"
                    );
                    Ok(ActivationOutcome::Queued {
                        run_id,
                        sequence_number,
                        bindings: report.entries.len(),
                    })
                }
                QueueCommit::NotActivatable(status) => Ok(skipped(run_id, status)),
            }
        } else {
            let missing = report.missing_keys();
            match track_missing_connections(
                self.store.as_ref(),
                self.notifier.as_ref(),
                run_id,
                &missing,
            )
            .await?
            {
                TrackOutcome::Parked {
                    missing, notified, ..
                } => {
                    info!(
                        run_id = %run_id,
                        job_id = %run.job_id,
                        missing = missing.len(),
                        notified = notified.len(),
                        "Run waiting on connections"
                    );
                    Ok(ActivationOutcome::WaitingOnConnections {
                        run_id,
                        missing,
                        notified,
                    })
                }
                TrackOutcome::NotActivatable(status) => Ok(skipped(run_id, status)),
            }
        }
    }

    /// Re-activate every run waiting on a connection of this shape.
    ///
    /// The matching missing connection is marked resolved; its run links are
    /// left for each run's own queue or park transaction to replace. A run
    /// whose re-activation fails stays linked, so a later event or the
    /// stranded-run sweep picks it up again. A failure on one run is logged
    /// and reported in its slot; the others still proceed.
    pub async fn connection_created(
        &self,
        connection: &IntegrationConnection,
    ) -> Result<Vec<(Uuid, Result<ActivationOutcome>)>> {
        let key = connection.key();
        let waiting = self.store.resolve_missing_connection(&key).await?;
        if waiting.is_empty() {
            debug!(connection_id = %connection.id, key = %key, "No runs waiting on connection");
            return Ok(Vec::new());
        }

        info!(
            connection_id = %connection.id,
            key = %key,
            runs = waiting.len(),
            "Connection created; re-activating waiting runs"
        );

        let mut outcomes = Vec::with_capacity(waiting.len());
        for run_id in waiting {
            let outcome = self.activate(run_id).await;
            if let Err(e) = &outcome {
                warn!(run_id = %run_id, error = %e, "Re-activation failed");
            }
            outcomes.push((run_id, outcome));
        }
        Ok(outcomes)
    }

    /// Same as [`Self::connection_created`], looking the connection up by id.
    /// Returns an empty list when the connection does not exist.
    pub async fn connection_created_by_id(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<(Uuid, Result<ActivationOutcome>)>> {
        match self.store.load_connection(connection_id).await? {
            Some(connection) => self.connection_created(&connection).await,
            None => {
                warn!(connection_id = %connection_id, "Connection not found");
                Ok(Vec::new())
            }
        }
    }
}

fn skipped(run_id: Uuid, status: RunStatus) -> ActivationOutcome {
    ActivationOutcome::Skipped {
        run_id,
        reason: SkipReason::NotActivatable { status },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_timeout_is_sixty_seconds() {
        assert_eq!(ActivationConfig::default().queue_timeout, Duration::from_secs(60));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let outcome = ActivationOutcome::Skipped {
            run_id: Uuid::nil(),
            reason: SkipReason::NotActivatable {
                status: RunStatus::Queued,
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"]["reason"], "not_activatable");
        assert_eq!(json["reason"]["status"], "QUEUED");
    }

    /// Delegates to the memory store but reports queued runs without their
    /// sequence number.
    struct UnsequencedStore(crate::memory::MemoryActivationStore);

    #[async_trait::async_trait]
    impl ActivationStore for UnsequencedStore {
        async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
            self.0.load_run(run_id).await
        }
        async fn load_job_version(&self, job_version_id: Uuid) -> Result<Option<JobVersion>> {
            self.0.load_job_version(job_version_id).await
        }
        async fn find_connection(
            &self,
            integration_id: Uuid,
            lookup: &crate::resolver::ConnectionLookup,
        ) -> Result<Option<IntegrationConnection>> {
            self.0.find_connection(integration_id, lookup).await
        }
        async fn load_connection(&self, connection_id: Uuid) -> Result<Option<IntegrationConnection>> {
            self.0.load_connection(connection_id).await
        }
        async fn queue_run(
            &self,
            transition: &crate::ports::QueueTransition,
        ) -> Result<QueueCommit> {
            Ok(match self.0.queue_run(transition).await? {
                QueueCommit::Queued(mut run) => {
                    run.sequence_number = None;
                    QueueCommit::Queued(run)
                }
                other => other,
            })
        }
        async fn park_run(
            &self,
            run_id: Uuid,
            missing: &[MissingConnectionKey],
        ) -> Result<crate::ports::ParkCommit> {
            self.0.park_run(run_id, missing).await
        }
        async fn resolve_missing_connection(&self, key: &MissingConnectionKey) -> Result<Vec<Uuid>> {
            self.0.resolve_missing_connection(key).await
        }
        async fn pending_run_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
            self.0.pending_run_ids(limit).await
        }
        async fn stranded_run_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
            self.0.stranded_run_ids(limit).await
        }
    }

    #[tokio::test]
    async fn queued_run_without_sequence_number_is_a_store_error() {
        let memory = crate::memory::MemoryActivationStore::new();
        let job_version = JobVersion {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            version: "1".into(),
            requirements: Vec::new(),
        };
        memory.insert_job_version(job_version.clone()).unwrap();
        let run = Run::pending(job_version.job_id, job_version.id, None);
        memory.insert_run(run.clone()).unwrap();

        let service = ActivationService::new(
            Arc::new(UnsequencedStore(memory)),
            Arc::new(crate::memory::RecordingNotifier::new()),
        );
        let err = service.activate(run.id).await.unwrap_err();
        assert!(matches!(err, ActivationError::Store(_)), "got {err:?}");
        assert!(err.to_string().contains("without a sequence number"));
    }

    #[test]
    fn outcome_run_id() {
        let id = Uuid::new_v4();
        let outcome = ActivationOutcome::Queued {
            run_id: id,
            sequence_number: 3,
            bindings: 0,
        };
        assert_eq!(outcome.run_id(), id);
    }
}
