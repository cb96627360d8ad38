//! Connection-created listener.
//!
//! `LISTEN`s on the channel the schema trigger notifies whenever an
//! integration connection is inserted, and re-activates the runs waiting on
//! a connection of that shape. The payload is the new connection's id.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use activation_core::ActivationService;

use crate::worker::PollSummary;

/// Wait before reconnecting after the listener connection drops
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct ConnectionListener {
    pool: PgPool,
    service: Arc<ActivationService>,
    channel: String,
}

impl ConnectionListener {
    pub fn new(pool: PgPool, service: Arc<ActivationService>, channel: impl Into<String>) -> Self {
        Self {
            pool,
            service,
            channel: channel.into(),
        }
    }

    /// Listen until `shutdown` flips to `true`, reconnecting on errors.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.listen(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    error!(channel = %self.channel, error = %e, "Connection listener failed; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!(channel = %self.channel, "Connection listener shutting down");
    }

    /// Returns `Ok(())` only on shutdown.
    async fn listen(&self, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        info!(channel = %self.channel, "Listening for new connections");

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    let notification = notification?;
                    reconcile_connection(&self.service, notification.payload()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Handle one connection-created payload. Malformed payloads are logged and
/// dropped.
pub async fn reconcile_connection(service: &ActivationService, payload: &str) -> PollSummary {
    let mut summary = PollSummary::default();
    let connection_id = match payload.trim().parse::<Uuid>() {
        Ok(id) => id,
        Err(e) => {
            warn!(payload, error = %e, "Ignoring malformed connection notification");
            return summary;
        }
    };

    match service.connection_created_by_id(connection_id).await {
        Ok(outcomes) => {
            for (_, outcome) in &outcomes {
                summary.record(outcome);
            }
            if summary.total() > 0 {
                info!(connection_id = %connection_id, ?summary, "Re-activated waiting runs");
            } else {
                debug!(connection_id = %connection_id, "No runs waiting on connection");
            }
        }
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "Connection reconciliation failed");
        }
    }
    summary
}
