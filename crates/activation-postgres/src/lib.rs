//! Postgres adapter for activation-core.
//!
//! Implements [`activation_core::ActivationStore`] and a `pg_notify`
//! provisioning notifier over a shared `PgPool`.

pub mod locks;
pub mod notifier;
pub mod schema;
pub mod sqlx_types;
pub mod store;

pub use notifier::{PgNotifyProvisioningNotifier, DEFAULT_PROVISIONING_CHANNEL};
pub use schema::{ensure_schema, CONNECTION_CREATED_CHANNEL};
pub use store::PgActivationStore;
