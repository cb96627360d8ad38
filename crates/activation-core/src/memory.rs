//! In-memory implementations of the activation ports.
//!
//! `MemoryActivationStore` mirrors the transactional contract of the Postgres
//! store: each commit happens under one critical section, and queue
//! transitions first take a per-job async lock keyed by the same advisory
//! lock key Postgres uses (so colliding jobs share a lock there too). Used by
//! the integration tests and for embedding without a database.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::ActivationError;
use crate::ports::{
    ActivationStore, ParkCommit, ProvisioningNotifier, QueueCommit, QueueTransition, Result,
};
use crate::resolver::ConnectionLookup;
use crate::sequencer::job_lock_key;
use crate::types::*;

/// A run handed to the dispatch queue by a queue transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub run_id: Uuid,
    pub sequence_number: i64,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<Uuid, Run>,
    job_versions: HashMap<Uuid, JobVersion>,
    connections: Vec<IntegrationConnection>,
    job_counters: HashMap<Uuid, i64>,
    bindings: HashMap<Uuid, Vec<RunConnectionBinding>>,
    missing: HashMap<MissingConnectionKey, MissingConnection>,
    missing_links: HashMap<Uuid, BTreeSet<Uuid>>,
    dispatch_queue: Vec<DispatchEntry>,
}

/// In-memory activation store.
#[derive(Default)]
pub struct MemoryActivationStore {
    state: Mutex<MemoryState>,
    job_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryActivationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ActivationError::Store(anyhow!("memory store state poisoned")))
    }

    fn job_lock(&self, job_id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .job_locks
            .lock()
            .map_err(|_| ActivationError::Store(anyhow!("memory store locks poisoned")))?;
        Ok(locks.entry(job_lock_key(job_id)).or_default().clone())
    }

    /// Take the job's sequence lock the way a concurrent queue transition
    /// would. Held until the guard drops.
    pub async fn lock_job(&self, job_id: Uuid) -> Result<OwnedMutexGuard<()>> {
        Ok(self.job_lock(job_id)?.lock_owned().await)
    }

    // ── Seeding ────────────────────────────────────────────────

    pub fn insert_job_version(&self, job_version: JobVersion) -> Result<()> {
        self.state()?
            .job_versions
            .insert(job_version.id, job_version);
        Ok(())
    }

    pub fn insert_run(&self, run: Run) -> Result<()> {
        self.state()?.runs.insert(run.id, run);
        Ok(())
    }

    /// Insert or replace a connection with the same
    /// (integration, connection type, account identifier).
    pub fn insert_connection(&self, connection: IntegrationConnection) -> Result<()> {
        let mut state = self.state()?;
        let key = connection.key();
        state.connections.retain(|c| c.key() != key);
        state.connections.push(connection);
        Ok(())
    }

    /// Delete a connection, as when a credential is revoked.
    pub fn remove_connection(&self, connection_id: Uuid) -> Result<()> {
        self.state()?.connections.retain(|c| c.id != connection_id);
        Ok(())
    }

    // ── Inspection ─────────────────────────────────────────────

    pub fn run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.state()?.runs.get(&run_id).cloned())
    }

    pub fn bindings(&self, run_id: Uuid) -> Result<Vec<RunConnectionBinding>> {
        Ok(self
            .state()?
            .bindings
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn job_counter(&self, job_id: Uuid) -> Result<Option<i64>> {
        Ok(self.state()?.job_counters.get(&job_id).copied())
    }

    pub fn missing_connections(&self) -> Result<Vec<MissingConnection>> {
        let mut all: Vec<MissingConnection> = self.state()?.missing.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    /// Runs currently linked to the missing connection with this key.
    pub fn missing_connection_runs(&self, key: &MissingConnectionKey) -> Result<Vec<Uuid>> {
        let state = self.state()?;
        Ok(state
            .missing
            .get(key)
            .and_then(|m| state.missing_links.get(&m.id))
            .map(|runs| runs.iter().copied().collect())
            .unwrap_or_default())
    }

    pub fn dispatched(&self) -> Result<Vec<DispatchEntry>> {
        Ok(self.state()?.dispatch_queue.clone())
    }

    // ── Commits ────────────────────────────────────────────────

    fn commit_queue(&self, transition: &QueueTransition) -> Result<QueueCommit> {
        let mut state = self.state()?;
        let state = &mut *state;

        let run = state
            .runs
            .get_mut(&transition.run_id)
            .ok_or_else(|| anyhow!("run {} not found", transition.run_id))?;
        if !run.status.is_activatable() {
            return Ok(QueueCommit::NotActivatable(run.status));
        }

        let counter = state.job_counters.entry(transition.job_id).or_insert(0);
        *counter += 1;
        let sequence_number = *counter;

        let now = Utc::now();
        run.status = RunStatus::Queued;
        run.queued_at = Some(now);
        run.sequence_number = Some(sequence_number);
        let queued = run.clone();

        state
            .bindings
            .insert(transition.run_id, transition.bindings.clone());
        for runs in state.missing_links.values_mut() {
            runs.remove(&transition.run_id);
        }
        state.dispatch_queue.push(DispatchEntry {
            run_id: transition.run_id,
            sequence_number,
            enqueued_at: now,
        });

        Ok(QueueCommit::Queued(queued))
    }

    fn commit_park(&self, run_id: Uuid, missing: &[MissingConnectionKey]) -> Result<ParkCommit> {
        let mut state = self.state()?;
        let state = &mut *state;

        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        if !run.status.is_activatable() {
            return Ok(ParkCommit::NotActivatable(run.status));
        }
        run.status = RunStatus::WaitingOnConnections;
        let parked = run.clone();

        let now = Utc::now();
        let mut links = Vec::with_capacity(missing.len());
        let mut linked_ids = BTreeSet::new();
        for key in missing {
            let missing_connection = state
                .missing
                .entry(key.clone())
                .or_insert_with(|| MissingConnection {
                    id: Uuid::new_v4(),
                    key: key.clone(),
                    resolved: false,
                    created_at: now,
                    updated_at: now,
                });
            missing_connection.resolved = false;
            missing_connection.updated_at = now;

            let runs = state
                .missing_links
                .entry(missing_connection.id)
                .or_default();
            let newly_linked = runs.insert(run_id);
            linked_ids.insert(missing_connection.id);

            links.push(MissingConnectionLink {
                missing_connection: missing_connection.clone(),
                newly_linked,
                run_count: runs.len() as i64,
            });
        }

        for (missing_connection_id, runs) in state.missing_links.iter_mut() {
            if !linked_ids.contains(missing_connection_id) {
                runs.remove(&run_id);
            }
        }

        Ok(ParkCommit::Parked { run: parked, links })
    }

    /// Order run ids oldest first, the way the Postgres store does.
    fn oldest_first(state: &MemoryState, run_ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
        let mut runs: Vec<&Run> = run_ids
            .into_iter()
            .filter_map(|id| state.runs.get(&id))
            .collect();
        runs.sort_by_key(|r| (r.created_at, r.id));
        runs.into_iter().map(|r| r.id).collect()
    }
}

/// Whether `connection` satisfies a missing connection of shape `key`.
fn satisfies(connection: &IntegrationConnection, key: &MissingConnectionKey) -> bool {
    connection.integration_id == key.integration_id
        && connection.connection_type == key.connection_type
        && match key.connection_type {
            ConnectionType::Developer => true,
            ConnectionType::External => connection.account_identifier == key.account_identifier,
        }
}

#[async_trait]
impl ActivationStore for MemoryActivationStore {
    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        self.run(run_id)
    }

    async fn load_job_version(&self, job_version_id: Uuid) -> Result<Option<JobVersion>> {
        Ok(self.state()?.job_versions.get(&job_version_id).cloned())
    }

    async fn find_connection(
        &self,
        integration_id: Uuid,
        lookup: &ConnectionLookup,
    ) -> Result<Option<IntegrationConnection>> {
        let key = lookup.missing_key(integration_id);
        Ok(self
            .state()?
            .connections
            .iter()
            .find(|c| satisfies(c, &key))
            .cloned())
    }

    async fn load_connection(&self, connection_id: Uuid) -> Result<Option<IntegrationConnection>> {
        Ok(self
            .state()?
            .connections
            .iter()
            .find(|c| c.id == connection_id)
            .cloned())
    }

    async fn queue_run(&self, transition: &QueueTransition) -> Result<QueueCommit> {
        let lock = self.job_lock(transition.job_id)?;
        let _guard = tokio::time::timeout(transition.timeout, lock.lock_owned())
            .await
            .map_err(|_| ActivationError::Timeout {
                run_id: transition.run_id,
                timeout: transition.timeout,
            })?;
        self.commit_queue(transition)
    }

    async fn park_run(&self, run_id: Uuid, missing: &[MissingConnectionKey]) -> Result<ParkCommit> {
        self.commit_park(run_id, missing)
    }

    async fn resolve_missing_connection(&self, key: &MissingConnectionKey) -> Result<Vec<Uuid>> {
        let mut state = self.state()?;
        let state = &mut *state;
        let Some(missing_connection) = state.missing.get_mut(key) else {
            return Ok(Vec::new());
        };
        missing_connection.resolved = true;
        missing_connection.updated_at = Utc::now();
        let linked: Vec<Uuid> = state
            .missing_links
            .get(&missing_connection.id)
            .map(|runs| runs.iter().copied().collect())
            .unwrap_or_default();
        Ok(Self::oldest_first(state, linked))
    }

    async fn pending_run_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
        let state = self.state()?;
        let mut pending: Vec<&Run> = state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| r.id)
            .collect())
    }

    async fn stranded_run_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
        let state = self.state()?;
        let waiting = state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::WaitingOnConnections)
            .map(|r| r.id);
        let stranded = waiting.filter(|run_id| {
            let mut linked = state
                .missing
                .values()
                .filter(|m| {
                    state
                        .missing_links
                        .get(&m.id)
                        .is_some_and(|runs| runs.contains(run_id))
                })
                .peekable();
            if linked.peek().is_none() {
                return true;
            }
            linked.any(|m| state.connections.iter().any(|c| satisfies(c, &m.key)))
        });
        let mut ids = Self::oldest_first(&state, stranded.collect::<Vec<_>>());
        ids.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Notifier that records every missing connection it is told about.
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<MissingConnection>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent deliveries fail (nothing is recorded while failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn notifications(&self) -> Vec<MissingConnection> {
        self.notified
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProvisioningNotifier for RecordingNotifier {
    async fn missing_connection_created(&self, missing: &MissingConnection) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ActivationError::Notification(format!(
                "provisioning unavailable for {}",
                missing.key
            )));
        }
        self.notified
            .lock()
            .map_err(|_| ActivationError::Store(anyhow!("notifier poisoned")))?
            .push(missing.clone());
        Ok(())
    }
}
