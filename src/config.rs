//! Worker configuration.
//!
//! Every setting can come from a flag or an `ACTIVATION_*` environment
//! variable; `.env` is loaded by the binary before parsing.

use std::time::Duration;

use activation_core::ActivationConfig;
use clap::Args;

/// Database and pipeline settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Postgres connection string
    #[arg(long, env = "ACTIVATION_DATABASE_URL")]
    pub database_url: String,

    /// Pool size
    #[arg(long, env = "ACTIVATION_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Ceiling on one queue transaction, including the wait on the job lock
    #[arg(long, env = "ACTIVATION_QUEUE_TIMEOUT_MS", default_value_t = 60_000)]
    pub queue_timeout_ms: u64,

    /// Channel provisioning requests are published on
    #[arg(
        long,
        env = "ACTIVATION_PROVISIONING_CHANNEL",
        default_value = activation_postgres::DEFAULT_PROVISIONING_CHANNEL
    )]
    pub provisioning_channel: String,

    /// Apply the bundled schema before starting
    #[arg(long)]
    pub ensure_schema: bool,
}

impl DatabaseArgs {
    pub fn activation_config(&self) -> ActivationConfig {
        ActivationConfig {
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
        }
    }
}

/// Settings for the long-running worker loop.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Sleep between polls when no pending runs were found
    #[arg(long, env = "ACTIVATION_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Pending runs fetched per poll
    #[arg(long, env = "ACTIVATION_BATCH_SIZE", default_value_t = 50)]
    pub batch_size: i64,

    /// Activations in flight at once
    #[arg(long, env = "ACTIVATION_CONCURRENCY", default_value_t = 8)]
    pub concurrency: usize,
}

impl WorkerArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerArgs {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            concurrency: 8,
        }
    }
}
