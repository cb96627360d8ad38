//! Schema bootstrap.
//!
//! Production schema management is external; `ensure_schema` exists for
//! tests and local development.

use anyhow::anyhow;
use sqlx::PgPool;

use activation_core::ports::Result;

use crate::locks::advisory_xact_lock;

/// The full activation schema (idempotent DDL).
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_run_activation.sql");

/// Channel the `integration_connections` insert trigger notifies with the
/// new connection's id.
pub const CONNECTION_CREATED_CHANNEL: &str = "activation_connection_created";

/// Serializes concurrent `ensure_schema` calls; DDL under
/// `IF NOT EXISTS` still races on the catalog otherwise.
const SCHEMA_LOCK_KEY: i64 = 0x5255_4e41_4354_0001;

/// Apply [`SCHEMA_SQL`] in one transaction.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(|e| anyhow!(e))?;
    advisory_xact_lock(&mut tx, SCHEMA_LOCK_KEY)
        .await
        .map_err(|e| anyhow!(e))?;
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;
    tx.commit().await.map_err(|e| anyhow!(e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_notifies_the_connection_created_channel() {
        let call = format!("pg_notify('{CONNECTION_CREATED_CHANNEL}', NEW.connection_id::text)");
        assert!(SCHEMA_SQL.contains(&call), "trigger must publish on {CONNECTION_CREATED_CHANNEL}");
    }
}
