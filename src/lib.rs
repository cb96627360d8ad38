//! Run activation worker.
//!
//! Wires `activation-core` to Postgres: a poller that activates `PENDING`
//! runs and a listener that re-activates runs parked on a connection once
//! that connection is created.

pub mod config;
pub mod listener;
pub mod worker;

pub use config::{DatabaseArgs, WorkerArgs};
pub use listener::{reconcile_connection, ConnectionListener};
pub use worker::{ActivationWorker, PollSummary};
