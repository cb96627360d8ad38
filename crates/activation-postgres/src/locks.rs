//! Transaction-scoped advisory locks.
//!
//! All locks here are `pg_advisory_xact_lock` variants: they are released by
//! the enclosing transaction's commit or rollback and have no unlock path.

use std::time::Duration;

use sqlx::{Postgres, Transaction};

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";
/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Block until the exclusive advisory lock `key` is held by `tx`.
pub async fn advisory_xact_lock(
    tx: &mut Transaction<'_, Postgres>,
    key: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Bound every statement in `tx` (the advisory lock wait included) to
/// `timeout`. `SET LOCAL` scopes the setting to this transaction only, so it
/// does not leak back into the pool.
pub async fn set_local_statement_timeout(
    tx: &mut Transaction<'_, Postgres>,
    timeout: Duration,
) -> Result<(), sqlx::Error> {
    // SET does not accept bind parameters.
    let millis = timeout.as_millis().max(1);
    sqlx::query(&format!("SET LOCAL statement_timeout = {millis}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Whether `err` is Postgres cancelling a statement for a timeout.
pub fn is_timeout(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(QUERY_CANCELED) | Some(LOCK_NOT_AVAILABLE)
        ),
        _ => false,
    }
}
