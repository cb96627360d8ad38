//! Pending-run poller.
//!
//! Fetches `PENDING` runs oldest first and activates up to `concurrency` of
//! them at once. Failed activations stay `PENDING` and are picked up again
//! on a later poll.
//!
//! Spare room in a batch goes to stranded runs: waiting runs whose missing
//! connection already exists but whose re-activation failed or never saw
//! the connection event.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use activation_core::ports::Result;
use activation_core::{ActivationOutcome, ActivationService};

use crate::config::WorkerArgs;

/// Backoff after a failed poll
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tally of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub queued: usize,
    pub waiting: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PollSummary {
    pub fn record(&mut self, outcome: &Result<ActivationOutcome>) {
        match outcome {
            Ok(ActivationOutcome::Queued { .. }) => self.queued += 1,
            Ok(ActivationOutcome::WaitingOnConnections { .. }) => self.waiting += 1,
            Ok(ActivationOutcome::Skipped { .. }) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.waiting + self.skipped + self.failed
    }
}

/// Polls for pending runs and activates them.
pub struct ActivationWorker {
    service: Arc<ActivationService>,
    args: WorkerArgs,
}

impl ActivationWorker {
    pub fn new(service: Arc<ActivationService>, args: WorkerArgs) -> Self {
        Self { service, args }
    }

    /// Activate one batch of pending runs.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let store = self.service.store();
        let mut run_ids = store.pending_run_ids(self.args.batch_size).await?;
        let room = self.args.batch_size - run_ids.len() as i64;
        if room > 0 {
            let stranded = store.stranded_run_ids(room).await?;
            if !stranded.is_empty() {
                info!(count = stranded.len(), "Re-activating stranded runs");
                run_ids.extend(stranded);
            }
        }
        if run_ids.is_empty() {
            return Ok(PollSummary::default());
        }
        debug!(count = run_ids.len(), "Activating runs");

        let outcomes: Vec<_> = stream::iter(run_ids)
            .map(|run_id| {
                let service = Arc::clone(&self.service);
                async move {
                    let outcome = service.activate(run_id).await;
                    if let Err(e) = &outcome {
                        warn!(
                            run_id = %run_id,
                            error = %e,
                            retryable = e.is_retryable(),
                            "Activation failed; run left for the next poll"
                        );
                    }
                    outcome
                }
            })
            .buffer_unordered(self.args.concurrency.max(1))
            .collect()
            .await;

        let mut summary = PollSummary::default();
        for outcome in &outcomes {
            summary.record(outcome);
        }
        Ok(summary)
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.args.poll_interval(),
            batch_size = self.args.batch_size,
            concurrency = self.args.concurrency,
            "Activation worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.poll_once().await {
                // A clean full batch means more may be waiting. Failures are
                // still PENDING and would be refetched at once.
                Ok(summary)
                    if summary.failed == 0 && summary.total() as i64 >= self.args.batch_size =>
                {
                    info!(?summary, "Activated full batch");
                    continue;
                }
                Ok(summary) => {
                    if summary.total() > 0 {
                        info!(?summary, "Activated pending runs");
                    }
                    self.args.poll_interval()
                }
                Err(e) => {
                    error!(error = %e, "Polling pending runs failed");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Activation worker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use activation_core::memory::{MemoryActivationStore, RecordingNotifier};
    use activation_core::types::{
        AuthSource, ConnectionType, Integration, IntegrationConnection, IntegrationRequirement,
        JobVersion, Run, RunStatus,
    };
    use activation_core::ActivationStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn job_version(auth_source: AuthSource) -> JobVersion {
        JobVersion {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            version: "1".into(),
            requirements: vec![IntegrationRequirement {
                key: "svc".into(),
                integration: Integration {
                    id: Uuid::new_v4(),
                    slug: "svc".into(),
                    auth_source,
                },
            }],
        }
    }

    fn worker(store: Arc<MemoryActivationStore>, batch_size: i64) -> ActivationWorker {
        let service = ActivationService::new(store, Arc::new(RecordingNotifier::new()));
        ActivationWorker::new(
            Arc::new(service),
            WorkerArgs {
                batch_size,
                concurrency: 4,
                ..WorkerArgs::default()
            },
        )
    }

    #[test]
    fn summary_counts_each_outcome() {
        let mut summary = PollSummary::default();
        summary.record(&Ok(ActivationOutcome::Queued {
            run_id: Uuid::nil(),
            sequence_number: 1,
            bindings: 0,
        }));
        summary.record(&Err(activation_core::ActivationError::Timeout {
            run_id: Uuid::nil(),
            timeout: Duration::from_secs(1),
        }));
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 2);
    }

    #[tokio::test]
    async fn poll_once_activates_pending_runs() {
        let store = Arc::new(MemoryActivationStore::new());
        let local = job_version(AuthSource::Local);
        let hosted = job_version(AuthSource::Hosted);
        store.insert_job_version(local.clone()).unwrap();
        store.insert_job_version(hosted.clone()).unwrap();

        let queued = Run::pending(local.job_id, local.id, None);
        let parked = Run::pending(hosted.job_id, hosted.id, None);
        store.insert_run(queued.clone()).unwrap();
        store.insert_run(parked.clone()).unwrap();

        let summary = worker(store.clone(), 10).poll_once().await.unwrap();

        assert_eq!(
            summary,
            PollSummary {
                queued: 1,
                waiting: 1,
                skipped: 0,
                failed: 0,
            }
        );
        assert_eq!(
            store.run(queued.id).unwrap().unwrap().status,
            RunStatus::Queued
        );
        assert_eq!(
            store.run(parked.id).unwrap().unwrap().status,
            RunStatus::WaitingOnConnections
        );
    }

    #[tokio::test]
    async fn poll_once_respects_batch_size() {
        let store = Arc::new(MemoryActivationStore::new());
        let version = job_version(AuthSource::Local);
        store.insert_job_version(version.clone()).unwrap();
        for _ in 0..5 {
            store
                .insert_run(Run::pending(version.job_id, version.id, None))
                .unwrap();
        }

        let worker = worker(store.clone(), 2);
        assert_eq!(worker.poll_once().await.unwrap().queued, 2);
        assert_eq!(worker.poll_once().await.unwrap().queued, 2);
        assert_eq!(worker.poll_once().await.unwrap().queued, 1);
        assert_eq!(worker.poll_once().await.unwrap(), PollSummary::default());
        assert_eq!(store.job_counter(version.job_id).unwrap(), Some(5));
    }

    #[tokio::test]
    async fn poll_once_recovers_stranded_runs() {
        let store = Arc::new(MemoryActivationStore::new());
        let hosted = job_version(AuthSource::Hosted);
        store.insert_job_version(hosted.clone()).unwrap();
        let run = Run::pending(hosted.job_id, hosted.id, None);
        store.insert_run(run.clone()).unwrap();

        let worker = worker(store.clone(), 10);
        assert_eq!(worker.poll_once().await.unwrap().waiting, 1);

        // The connection lands without an event reaching the listener.
        let connection = IntegrationConnection {
            id: Uuid::new_v4(),
            integration_id: hosted.requirements[0].integration.id,
            connection_type: ConnectionType::Developer,
            account_identifier: None,
            created_at: Utc::now(),
        };
        store.insert_connection(connection.clone()).unwrap();
        assert_eq!(store.stranded_run_ids(10).await.unwrap(), vec![run.id]);

        assert_eq!(worker.poll_once().await.unwrap().queued, 1);
        assert_eq!(store.run(run.id).unwrap().unwrap().status, RunStatus::Queued);
        assert!(store
            .missing_connection_runs(&connection.key())
            .unwrap()
            .is_empty());
        assert_eq!(worker.poll_once().await.unwrap(), PollSummary::default());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryActivationStore::new());
        let worker = worker(store, 10);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
