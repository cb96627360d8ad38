//! Connection Resolver
//!
//! Classifies every integration requirement of a run's job version as
//! resolved (local, resolver, hosted) or missing. Read-only, and recomputed
//! on every activation attempt because connections may appear between
//! attempts.

use serde::Serialize;
use uuid::Uuid;

use crate::ports::{ActivationStore, Result};
use crate::types::*;

// ---------------------------------------------------------------------------
// ConnectionLookup
// ---------------------------------------------------------------------------

/// Which hosted connection a run needs. Exactly one lookup is made per
/// requirement; there is no fallback from external to developer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionLookup {
    Developer,
    External { account_identifier: String },
}

impl ConnectionLookup {
    pub fn for_run(run: &Run) -> Self {
        match &run.external_account_id {
            Some(account) => Self::External {
                account_identifier: account.clone(),
            },
            None => Self::Developer,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Self::Developer => ConnectionType::Developer,
            Self::External { .. } => ConnectionType::External,
        }
    }

    pub fn account_identifier(&self) -> Option<&str> {
        match self {
            Self::Developer => None,
            Self::External { account_identifier } => Some(account_identifier),
        }
    }

    /// Missing-connection identity for this lookup against one integration.
    pub fn missing_key(&self, integration_id: Uuid) -> MissingConnectionKey {
        MissingConnectionKey {
            integration_id,
            connection_type: self.connection_type(),
            account_identifier: self.account_identifier().map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// RequirementResolution
// ---------------------------------------------------------------------------

/// Outcome for one requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequirementResolution {
    /// `LOCAL` integration, no binding needed.
    ResolvedLocal { integration_id: Uuid },
    /// `RESOLVER` integration, no binding needed.
    ResolvedByResolver { integration_id: Uuid },
    /// `HOSTED` integration with a matching connection.
    ResolvedHosted { connection: IntegrationConnection },
    /// `HOSTED` integration with no matching connection.
    Missing { key: MissingConnectionKey },
}

impl RequirementResolution {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }

    /// Binding to persist at queue time. `None` for missing requirements.
    pub fn binding(&self, requirement_key: &str) -> Option<RunConnectionBinding> {
        let (integration_id, kind, connection_id) = match self {
            Self::ResolvedLocal { integration_id } => (*integration_id, BindingKind::Local, None),
            Self::ResolvedByResolver { integration_id } => {
                (*integration_id, BindingKind::Resolver, None)
            }
            Self::ResolvedHosted { connection } => (
                connection.integration_id,
                BindingKind::Hosted,
                Some(connection.id),
            ),
            Self::Missing { .. } => return None,
        };
        Some(RunConnectionBinding {
            key: requirement_key.to_string(),
            integration_id,
            kind,
            connection_id,
        })
    }
}

// ---------------------------------------------------------------------------
// ResolutionReport
// ---------------------------------------------------------------------------

/// Per-requirement outcomes, in the job version's declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub entries: Vec<(String, RequirementResolution)>,
}

impl ResolutionReport {
    pub fn get(&self, key: &str) -> Option<&RequirementResolution> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, resolution)| resolution)
    }

    pub fn is_complete(&self) -> bool {
        !self.entries.iter().any(|(_, r)| r.is_missing())
    }

    /// Distinct missing-connection keys, in first-seen order. Two
    /// requirements on the same integration collapse into one key.
    pub fn missing_keys(&self) -> Vec<MissingConnectionKey> {
        let mut keys: Vec<MissingConnectionKey> = Vec::new();
        for (_, resolution) in &self.entries {
            if let RequirementResolution::Missing { key } = resolution {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// Bindings for every resolved requirement.
    pub fn bindings(&self) -> Vec<RunConnectionBinding> {
        self.entries
            .iter()
            .filter_map(|(key, resolution)| resolution.binding(key))
            .collect()
    }
}

/// Resolve every requirement of `job_version` for `run`.
pub async fn resolve_connections(
    store: &dyn ActivationStore,
    run: &Run,
    job_version: &JobVersion,
) -> Result<ResolutionReport> {
    let lookup = ConnectionLookup::for_run(run);
    let mut entries = Vec::with_capacity(job_version.requirements.len());

    for requirement in &job_version.requirements {
        let integration = &requirement.integration;
        let resolution = match integration.auth_source {
            AuthSource::Local => RequirementResolution::ResolvedLocal {
                integration_id: integration.id,
            },
            AuthSource::Resolver => RequirementResolution::ResolvedByResolver {
                integration_id: integration.id,
            },
            AuthSource::Hosted => match store.find_connection(integration.id, &lookup).await? {
                Some(connection) => RequirementResolution::ResolvedHosted { connection },
                None => RequirementResolution::Missing {
                    key: lookup.missing_key(integration.id),
                },
            },
        };
        entries.push((requirement.key.clone(), resolution));
    }

    Ok(ResolutionReport { entries })
}
