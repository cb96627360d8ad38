//! Run activation core.
//!
//! Moves scheduled runs from `PENDING` to either `QUEUED` (every integration
//! requirement has credentials) or `WAITING_ON_CONNECTIONS` (some hosted
//! connection is missing). Pure domain logic over the port traits in
//! [`ports`]; the Postgres adapter lives in `activation-postgres`.

pub mod error;
pub mod gate;
pub mod memory;
pub mod notify;
pub mod ports;
pub mod queue;
pub mod resolver;
pub mod sequencer;
pub mod tracker;
pub mod types;

pub use error::ActivationError;
pub use gate::{ActivationConfig, ActivationOutcome, ActivationService, SkipReason};
pub use ports::{ActivationStore, ProvisioningNotifier};
pub use resolver::{ConnectionLookup, RequirementResolution, ResolutionReport};
pub use sequencer::job_lock_key;
