//! Provisioning notifications over `pg_notify`.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use activation_core::ports::{ProvisioningNotifier, Result};
use activation_core::types::MissingConnection;

/// Default channel provisioning services `LISTEN` on.
pub const DEFAULT_PROVISIONING_CHANNEL: &str = "activation_missing_connection";

/// JSON body published for each newly created missing connection.
#[derive(Debug, Serialize)]
pub struct ProvisioningPayload<'a> {
    pub missing_connection_id: Uuid,
    pub integration_id: Uuid,
    pub connection_type: &'a str,
    pub account_identifier: Option<&'a str>,
}

impl<'a> From<&'a MissingConnection> for ProvisioningPayload<'a> {
    fn from(missing: &'a MissingConnection) -> Self {
        Self {
            missing_connection_id: missing.id,
            integration_id: missing.key.integration_id,
            connection_type: missing.key.connection_type.as_str(),
            account_identifier: missing.key.account_identifier.as_deref(),
        }
    }
}

pub struct PgNotifyProvisioningNotifier {
    pool: PgPool,
    channel: String,
}

impl PgNotifyProvisioningNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, DEFAULT_PROVISIONING_CHANNEL)
    }

    pub fn with_channel(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ProvisioningNotifier for PgNotifyProvisioningNotifier {
    async fn missing_connection_created(&self, missing: &MissingConnection) -> Result<()> {
        let payload = serde_json::to_string(&ProvisioningPayload::from(missing))
            .map_err(|e| anyhow!(e))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| activation_core::ActivationError::Notification(e.to_string()))?;
        tracing::debug!(
            channel = %self.channel,
            missing_connection_id = %missing.id,
            "Published provisioning request"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use activation_core::types::{ConnectionType, MissingConnectionKey};
    use chrono::Utc;

    #[test]
    fn payload_carries_the_connection_shape() {
        let now = Utc::now();
        let missing = MissingConnection {
            id: Uuid::nil(),
            key: MissingConnectionKey {
                integration_id: Uuid::nil(),
                connection_type: ConnectionType::External,
                account_identifier: Some("acct_7".into()),
            },
            resolved: false,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(ProvisioningPayload::from(&missing)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "missing_connection_id": "00000000-0000-0000-0000-000000000000",
                "integration_id": "00000000-0000-0000-0000-000000000000",
                "connection_type": "EXTERNAL",
                "account_identifier": "acct_7",
            })
        );
    }
}
