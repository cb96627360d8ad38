//! Postgres implementation of the activation store port.
//!
//! All SQL is runtime-checked (sqlx::query, not sqlx::query!) so the crate
//! builds without a live database.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use activation_core::error::ActivationError;
use activation_core::ports::{ActivationStore, ParkCommit, QueueCommit, QueueTransition, Result};
use activation_core::resolver::ConnectionLookup;
use activation_core::sequencer::job_lock_key;
use activation_core::types::*;

use crate::locks::{advisory_xact_lock, is_timeout, set_local_statement_timeout};
use crate::sqlx_types::{PgConnectionRow, PgMissingConnectionRow, PgRequirementRow, PgRunRow};

const RUN_COLUMNS: &str = "run_id, job_id, job_version_id, status, external_account_id, \
                           sequence_number, created_at, queued_at";

// ── PgActivationStore ─────────────────────────────────────────

/// Postgres-backed activation store.
pub struct PgActivationStore {
    pool: PgPool,
}

impl PgActivationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn queue_run_tx(&self, transition: &QueueTransition) -> Result<QueueCommit> {
        let tx_err = |e: sqlx::Error| {
            if is_timeout(&e) {
                ActivationError::Timeout {
                    run_id: transition.run_id,
                    timeout: transition.timeout,
                }
            } else {
                ActivationError::Store(anyhow!(e))
            }
        };

        let mut tx = self.pool.begin().await.map_err(tx_err)?;
        set_local_statement_timeout(&mut tx, transition.timeout)
            .await
            .map_err(tx_err)?;
        advisory_xact_lock(&mut tx, job_lock_key(transition.job_id))
            .await
            .map_err(tx_err)?;

        let run = lock_run(&mut tx, transition.run_id).await.map_err(tx_err)?;
        let run = to_run(run)?;
        if !run.status.is_activatable() {
            tx.rollback().await.map_err(tx_err)?;
            return Ok(QueueCommit::NotActivatable(run.status));
        }

        let sequence_number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO activation.job_counters (job_id, last_number)
            VALUES ($1, 1)
            ON CONFLICT (job_id) DO UPDATE
                SET last_number = activation.job_counters.last_number + 1,
                    updated_at = now()
            RETURNING last_number
            "#,
        )
        .bind(transition.job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(tx_err)?;

        let queued = sqlx::query_as::<_, PgRunRow>(&format!(
            r#"
            UPDATE activation.runs
            SET status = 'QUEUED',
                queued_at = now(),
                sequence_number = $2,
                updated_at = now()
            WHERE run_id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(transition.run_id)
        .bind(sequence_number)
        .fetch_one(&mut *tx)
        .await
        .map_err(tx_err)?;

        for binding in &transition.bindings {
            sqlx::query(
                r#"
                INSERT INTO activation.run_connection_bindings
                    (run_id, requirement_key, integration_id, kind, connection_id)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(transition.run_id)
            .bind(&binding.key)
            .bind(binding.integration_id)
            .bind(binding.kind.as_str())
            .bind(binding.connection_id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err)?;
        }

        sqlx::query("DELETE FROM activation.missing_connection_runs WHERE run_id = $1")
            .bind(transition.run_id)
            .execute(&mut *tx)
            .await
            .map_err(tx_err)?;

        sqlx::query(
            r#"
            INSERT INTO activation.run_dispatch_queue (run_id, sequence_number)
            VALUES ($1, $2)
            "#,
        )
        .bind(transition.run_id)
        .bind(sequence_number)
        .execute(&mut *tx)
        .await
        .map_err(tx_err)?;

        tx.commit().await.map_err(tx_err)?;
        Ok(QueueCommit::Queued(to_run(queued)?))
    }
}

/// Row-lock the run for the rest of the transaction.
async fn lock_run(
    tx: &mut Transaction<'_, Postgres>,
    run_id: Uuid,
) -> std::result::Result<PgRunRow, sqlx::Error> {
    sqlx::query_as::<_, PgRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM activation.runs WHERE run_id = $1 FOR UPDATE"
    ))
    .bind(run_id)
    .fetch_one(&mut **tx)
    .await
}

fn to_run(row: PgRunRow) -> Result<Run> {
    row.try_into()
        .map_err(|e: String| ActivationError::Store(anyhow!(e)))
}

async fn upsert_missing_connection(
    tx: &mut Transaction<'_, Postgres>,
    key: &MissingConnectionKey,
) -> Result<MissingConnection> {
    let row = sqlx::query_as::<_, PgMissingConnectionRow>(
        r#"
        INSERT INTO activation.missing_connections
            (missing_connection_id, integration_id, connection_type, account_identifier)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT ON CONSTRAINT missing_connections_shape_key DO UPDATE
            SET resolved = false,
                updated_at = now()
        RETURNING missing_connection_id, integration_id, connection_type,
                  account_identifier, resolved, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(key.integration_id)
    .bind(key.connection_type.as_str())
    .bind(key.account_identifier.as_deref())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| anyhow!(e))?;
    row.try_into()
        .map_err(|e: String| ActivationError::Store(anyhow!(e)))
}

#[async_trait]
impl ActivationStore for PgActivationStore {
    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, PgRunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM activation.runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(to_run).transpose()
    }

    async fn load_job_version(&self, job_version_id: Uuid) -> Result<Option<JobVersion>> {
        let header: Option<(Uuid, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT job_version_id, job_id, version
            FROM activation.job_versions
            WHERE job_version_id = $1
            "#,
        )
        .bind(job_version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        let Some((id, job_id, version)) = header else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, PgRequirementRow>(
            r#"
            SELECT r.requirement_key, i.integration_id, i.slug, i.auth_source
            FROM activation.integration_requirements r
            JOIN activation.integrations i ON i.integration_id = r.integration_id
            WHERE r.job_version_id = $1
            ORDER BY r.ordinal, r.requirement_key
            "#,
        )
        .bind(job_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        let requirements = rows
            .into_iter()
            .map(|r| {
                r.try_into()
                    .map_err(|e: String| ActivationError::Store(anyhow!(e)))
            })
            .collect::<Result<Vec<IntegrationRequirement>>>()?;

        Ok(Some(JobVersion {
            id,
            job_id,
            version,
            requirements,
        }))
    }

    async fn find_connection(
        &self,
        integration_id: Uuid,
        lookup: &ConnectionLookup,
    ) -> Result<Option<IntegrationConnection>> {
        let row = sqlx::query_as::<_, PgConnectionRow>(
            r#"
            SELECT connection_id, integration_id, connection_type,
                   account_identifier, created_at
            FROM activation.integration_connections
            WHERE integration_id = $1
              AND connection_type = $2
              AND ($2 = 'DEVELOPER' OR account_identifier = $3)
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(integration_id)
        .bind(lookup.connection_type().as_str())
        .bind(lookup.account_identifier())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(|r| {
            r.try_into()
                .map_err(|e: String| ActivationError::Store(anyhow!(e)))
        })
        .transpose()
    }

    async fn load_connection(&self, connection_id: Uuid) -> Result<Option<IntegrationConnection>> {
        let row = sqlx::query_as::<_, PgConnectionRow>(
            r#"
            SELECT connection_id, integration_id, connection_type,
                   account_identifier, created_at
            FROM activation.integration_connections
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        row.map(|r| {
            r.try_into()
                .map_err(|e: String| ActivationError::Store(anyhow!(e)))
        })
        .transpose()
    }

    async fn queue_run(&self, transition: &QueueTransition) -> Result<QueueCommit> {
        // statement_timeout bounds each statement; this bounds the whole
        // transaction. Dropping the future rolls the transaction back.
        tokio::time::timeout(transition.timeout, self.queue_run_tx(transition))
            .await
            .map_err(|_| ActivationError::Timeout {
                run_id: transition.run_id,
                timeout: transition.timeout,
            })?
    }

    async fn park_run(&self, run_id: Uuid, missing: &[MissingConnectionKey]) -> Result<ParkCommit> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let run = to_run(lock_run(&mut tx, run_id).await.map_err(|e| anyhow!(e))?)?;
        if !run.status.is_activatable() {
            tx.rollback().await.map_err(|e| anyhow!(e))?;
            return Ok(ParkCommit::NotActivatable(run.status));
        }

        let parked = sqlx::query_as::<_, PgRunRow>(&format!(
            r#"
            UPDATE activation.runs
            SET status = 'WAITING_ON_CONNECTIONS',
                updated_at = now()
            WHERE run_id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        // Upsert in key order so concurrent parks on overlapping keys take
        // the shape-key row locks in the same order.
        let ordered: BTreeSet<&MissingConnectionKey> = missing.iter().collect();
        let mut by_key: BTreeMap<&MissingConnectionKey, MissingConnectionLink> = BTreeMap::new();
        for key in ordered {
            let missing_connection = upsert_missing_connection(&mut tx, key).await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO activation.missing_connection_runs (missing_connection_id, run_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(missing_connection.id)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            let run_count: i64 = sqlx::query_scalar(
                r#"
                SELECT count(*)
                FROM activation.missing_connection_runs
                WHERE missing_connection_id = $1
                "#,
            )
            .bind(missing_connection.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            by_key.insert(
                key,
                MissingConnectionLink {
                    missing_connection,
                    newly_linked: inserted.rows_affected() == 1,
                    run_count,
                },
            );
        }

        // Requirements satisfied since the last park no longer hold the run.
        let linked_ids: Vec<Uuid> = by_key
            .values()
            .map(|link| link.missing_connection.id)
            .collect();
        sqlx::query(
            r#"
            DELETE FROM activation.missing_connection_runs
            WHERE run_id = $1
              AND missing_connection_id <> ALL($2)
            "#,
        )
        .bind(run_id)
        .bind(&linked_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;

        let links = missing
            .iter()
            .map(|key| {
                by_key
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ActivationError::Store(anyhow!("no link written for {key}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ParkCommit::Parked {
            run: to_run(parked)?,
            links,
        })
    }

    async fn resolve_missing_connection(&self, key: &MissingConnectionKey) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let missing_connection_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE activation.missing_connections
            SET resolved = true,
                updated_at = now()
            WHERE integration_id = $1
              AND connection_type = $2
              AND account_identifier IS NOT DISTINCT FROM $3
            RETURNING missing_connection_id
            "#,
        )
        .bind(key.integration_id)
        .bind(key.connection_type.as_str())
        .bind(key.account_identifier.as_deref())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        let Some(missing_connection_id) = missing_connection_id else {
            tx.commit().await.map_err(|e| anyhow!(e))?;
            return Ok(Vec::new());
        };

        let run_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT l.run_id
            FROM activation.missing_connection_runs l
            JOIN activation.runs r ON r.run_id = l.run_id
            WHERE l.missing_connection_id = $1
            ORDER BY r.created_at, l.run_id
            "#,
        )
        .bind(missing_connection_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(run_ids)
    }

    async fn pending_run_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT run_id
            FROM activation.runs
            WHERE status = 'PENDING'
            ORDER BY created_at, run_id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(ids)
    }

    async fn stranded_run_ids(&self, limit: i64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT r.run_id
            FROM activation.runs r
            WHERE r.status = 'WAITING_ON_CONNECTIONS'
              AND (
                  NOT EXISTS (
                      SELECT 1
                      FROM activation.missing_connection_runs l
                      WHERE l.run_id = r.run_id
                  )
                  OR EXISTS (
                      SELECT 1
                      FROM activation.missing_connection_runs l
                      JOIN activation.missing_connections m
                        ON m.missing_connection_id = l.missing_connection_id
                      JOIN activation.integration_connections c
                        ON c.integration_id = m.integration_id
                       AND c.connection_type = m.connection_type
                       AND (m.connection_type = 'DEVELOPER'
                            OR c.account_identifier = m.account_identifier)
                      WHERE l.run_id = r.run_id
                  )
              )
            ORDER BY r.created_at, r.run_id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(ids)
    }
}
