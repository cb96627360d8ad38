//! Provisioning notifiers that need no external system.

use async_trait::async_trait;
use tracing::info;

use crate::ports::{ProvisioningNotifier, Result};
use crate::types::MissingConnection;

/// Logs each first-time missing connection. Useful where provisioning is
/// driven by log-based alerting or as a stand-in during local development.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProvisioningNotifier;

#[async_trait]
impl ProvisioningNotifier for TracingProvisioningNotifier {
    async fn missing_connection_created(&self, missing: &MissingConnection) -> Result<()> {
        info!(
            missing_connection_id = %missing.id,
            integration_id = %missing.key.integration_id,
            connection_type = %missing.key.connection_type,
            account_identifier = missing.key.account_identifier.as_deref().unwrap_or(""),
            "Connection provisioning needed"
        );
        Ok(())
    }
}
