//! Storage and notification port traits for the activation pipeline.
//! Implemented by activation-postgres (and `memory` for tests); core logic
//! depends only on these traits.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ActivationError;
use crate::resolver::ConnectionLookup;
use crate::types::*;

pub type Result<T> = std::result::Result<T, ActivationError>;

/// Everything the store needs to queue one run atomically.
#[derive(Debug, Clone)]
pub struct QueueTransition {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub bindings: Vec<RunConnectionBinding>,
    /// Ceiling for the whole transaction, including the wait on the job's
    /// sequence lock.
    pub timeout: Duration,
}

/// Result of the queue transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCommit {
    /// The run is now `QUEUED` with a sequence number and has been handed to
    /// the dispatch queue in the same transaction.
    Queued(Run),
    /// Another attempt moved the run on first; nothing was written and no
    /// sequence number was consumed.
    NotActivatable(RunStatus),
}

/// Result of the park transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParkCommit {
    /// The run is now `WAITING_ON_CONNECTIONS` and linked to every missing
    /// connection in `links` (same order as the keys passed in).
    Parked {
        run: Run,
        links: Vec<MissingConnectionLink>,
    },
    NotActivatable(RunStatus),
}

/// Persistence operations for run activation.
///
/// `queue_run` and `park_run` each run in one transaction and re-check the
/// run's status under a row lock before writing, so concurrent activations
/// of the same run cannot both succeed.
#[async_trait]
pub trait ActivationStore: Send + Sync {
    // ── Reads ──────────────────────────────────────────────────

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Load a job version with its requirements in declaration order.
    async fn load_job_version(&self, job_version_id: Uuid) -> Result<Option<JobVersion>>;

    /// Exact-match connection lookup. `Developer` ignores account identifiers;
    /// `External` matches the identifier exactly.
    async fn find_connection(
        &self,
        integration_id: Uuid,
        lookup: &ConnectionLookup,
    ) -> Result<Option<IntegrationConnection>>;

    /// Load a connection by id (used by connection-created reconciliation).
    async fn load_connection(&self, connection_id: Uuid) -> Result<Option<IntegrationConnection>>;

    // ── Queue transition ───────────────────────────────────────

    /// In one transaction bounded by `transition.timeout`: lock the job's
    /// sequence key, re-check the run status, increment the job counter,
    /// mark the run `QUEUED` with `queued_at` and the sequence number, insert
    /// the bindings, drop the run's missing-connection links and enqueue the
    /// run for dispatch.
    ///
    /// On timeout or error nothing is visible and `ActivationError::Timeout`
    /// or `ActivationError::Store` is returned.
    async fn queue_run(&self, transition: &QueueTransition) -> Result<QueueCommit>;

    // ── Missing connections ────────────────────────────────────

    /// In one transaction: re-check the run status, set it to
    /// `WAITING_ON_CONNECTIONS`, upsert one missing connection per key
    /// (clearing `resolved`), link the run to each, drop the run's links to
    /// keys no longer in `missing`, and report each link's `newly_linked`
    /// flag and post-write run count as read inside the same transaction.
    async fn park_run(&self, run_id: Uuid, missing: &[MissingConnectionKey]) -> Result<ParkCommit>;

    /// Mark the missing connection with this key resolved and return the
    /// ids of the runs linked to it, oldest first. Links stay in place until
    /// the run is queued or re-parked, so a failed re-activation can be
    /// retried. Returns an empty list if no such missing connection exists.
    async fn resolve_missing_connection(&self, key: &MissingConnectionKey) -> Result<Vec<Uuid>>;

    // ── Polling ────────────────────────────────────────────────

    /// Ids of `PENDING` runs, oldest first.
    async fn pending_run_ids(&self, limit: i64) -> Result<Vec<Uuid>>;

    /// Ids of `WAITING_ON_CONNECTIONS` runs that an existing connection may
    /// now unblock, oldest first: runs with no missing-connection link, and
    /// runs linked to a missing connection whose shape now has a matching
    /// connection.
    async fn stranded_run_ids(&self, limit: i64) -> Result<Vec<Uuid>>;
}

/// Out-of-band credential provisioning collaborator.
///
/// Called once per missing connection when it is first associated with a
/// run. Delivery failures are logged by the caller and never undo the park.
#[async_trait]
pub trait ProvisioningNotifier: Send + Sync {
    async fn missing_connection_created(&self, missing: &MissingConnection) -> Result<()>;
}
