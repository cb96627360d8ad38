//! Run Activation Types
//!
//! Rows the activation pipeline reads and writes: runs, the job version
//! snapshot they target, integrations and their connections, missing
//! connection records and the bindings persisted at queue time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
///
/// Only `Pending` and `WaitingOnConnections` are activatable. `Queued` is the
/// last status this pipeline writes; everything after it belongs to the
/// execution dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    WaitingOnConnections,
    Queued,
    Started,
    Success,
    Failure,
    TimedOut,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::WaitingOnConnections => "WAITING_ON_CONNECTIONS",
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::TimedOut => "TIMED_OUT",
            Self::Canceled => "CANCELED",
        }
    }

    /// Statuses from which `activate` may move the run forward.
    pub fn is_activatable(&self) -> bool {
        matches!(self, Self::Pending | Self::WaitingOnConnections)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "WAITING_ON_CONNECTIONS" => Ok(Self::WaitingOnConnections),
            "QUEUED" => Ok(Self::Queued),
            "STARTED" => Ok(Self::Started),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "CANCELED" => Ok(Self::Canceled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthSource / ConnectionType
// ---------------------------------------------------------------------------

/// Where an integration's credentials come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthSource {
    /// Caller supplies credentials out of band.
    Local,
    /// Custom resolver logic supplies credentials at execution time.
    Resolver,
    /// A persisted `IntegrationConnection` is required.
    Hosted,
}

impl AuthSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Resolver => "RESOLVER",
            Self::Hosted => "HOSTED",
        }
    }
}

impl std::fmt::Display for AuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuthSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCAL" => Ok(Self::Local),
            "RESOLVER" => Ok(Self::Resolver),
            "HOSTED" => Ok(Self::Hosted),
            _ => Err(format!("Unknown auth source: {}", s)),
        }
    }
}

/// Scope of a hosted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// The job owner's own account.
    Developer,
    /// A specific external account, identified by `account_identifier`.
    External,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "DEVELOPER",
            Self::External => "EXTERNAL",
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEVELOPER" => Ok(Self::Developer),
            "EXTERNAL" => Ok(Self::External),
            _ => Err(format!("Unknown connection type: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_version_id: Uuid,
    pub status: RunStatus,
    /// Set when the run executes on behalf of an external account rather
    /// than the job owner's default account.
    pub external_account_id: Option<String>,
    /// Absent until the run is queued.
    pub sequence_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
}

impl Run {
    /// A freshly scheduled run in `PENDING`.
    pub fn pending(job_id: Uuid, job_version_id: Uuid, external_account_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            job_version_id,
            status: RunStatus::Pending,
            external_account_id,
            sequence_number: None,
            created_at: Utc::now(),
            queued_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job versions and integrations
// ---------------------------------------------------------------------------

/// A registered external-service definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    /// Human-facing identifier (e.g. "github", "shopify").
    pub slug: String,
    pub auth_source: AuthSource,
}

/// One declared integration requirement of a job version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationRequirement {
    /// Unique within the job version.
    pub key: String,
    pub integration: Integration,
}

/// Immutable snapshot of a job's integration requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVersion {
    pub id: Uuid,
    pub job_id: Uuid,
    pub version: String,
    /// Declaration order is preserved.
    pub requirements: Vec<IntegrationRequirement>,
}

/// A persisted credential binding for one integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConnection {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub connection_type: ConnectionType,
    /// `None` for `Developer` connections.
    pub account_identifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IntegrationConnection {
    /// The shape a missing connection would need to match this connection.
    pub fn key(&self) -> MissingConnectionKey {
        MissingConnectionKey {
            integration_id: self.integration_id,
            connection_type: self.connection_type,
            account_identifier: self.account_identifier.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Missing connections
// ---------------------------------------------------------------------------

/// Identity of a missing connection: (integration, connection type, account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MissingConnectionKey {
    pub integration_id: Uuid,
    pub connection_type: ConnectionType,
    pub account_identifier: Option<String>,
}

impl std::fmt::Display for MissingConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.account_identifier {
            Some(account) => write!(
                f,
                "{}:{}:{}",
                self.integration_id, self.connection_type, account
            ),
            None => write!(f, "{}:{}", self.integration_id, self.connection_type),
        }
    }
}

/// Durable record that one or more runs wait on a connection of this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingConnection {
    pub id: Uuid,
    pub key: MissingConnectionKey,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A run's association with a missing connection, as seen by the
/// transaction that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingConnectionLink {
    pub missing_connection: MissingConnection,
    /// True when this transaction created the run link (it did not exist before).
    pub newly_linked: bool,
    /// Number of runs linked after this transaction's write.
    pub run_count: i64,
}

// ---------------------------------------------------------------------------
// Connection bindings
// ---------------------------------------------------------------------------

/// How a requirement was satisfied at queue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BindingKind {
    Local,
    Resolver,
    Hosted,
}

impl BindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Resolver => "RESOLVER",
            Self::Hosted => "HOSTED",
        }
    }
}

impl std::fmt::Display for BindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted binding of one requirement of a queued run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConnectionBinding {
    pub key: String,
    pub integration_id: Uuid,
    pub kind: BindingKind,
    /// Only present for `Hosted` bindings.
    pub connection_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::WaitingOnConnections,
            RunStatus::Queued,
            RunStatus::Started,
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::TimedOut,
            RunStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<RunStatus>().is_err());
    }

    #[test]
    fn only_pending_and_waiting_are_activatable() {
        assert!(RunStatus::Pending.is_activatable());
        assert!(RunStatus::WaitingOnConnections.is_activatable());
        assert!(!RunStatus::Queued.is_activatable());
        assert!(!RunStatus::Failure.is_activatable());
    }

    #[test]
    fn run_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&RunStatus::WaitingOnConnections).unwrap();
        assert_eq!(json, "\"WAITING_ON_CONNECTIONS\"");
    }

    #[test]
    fn missing_key_display_includes_account_when_external() {
        let integration_id = Uuid::nil();
        let developer = MissingConnectionKey {
            integration_id,
            connection_type: ConnectionType::Developer,
            account_identifier: None,
        };
        let external = MissingConnectionKey {
            integration_id,
            connection_type: ConnectionType::External,
            account_identifier: Some("acct_42".into()),
        };
        assert_eq!(
            developer.to_string(),
            "00000000-0000-0000-0000-000000000000:DEVELOPER"
        );
        assert_eq!(
            external.to_string(),
            "00000000-0000-0000-0000-000000000000:EXTERNAL:acct_42"
        );
    }

    #[test]
    fn connection_key_matches_its_shape() {
        let conn = IntegrationConnection {
            id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            connection_type: ConnectionType::External,
            account_identifier: Some("acct_1".into()),
            created_at: Utc::now(),
        };
        let key = conn.key();
        assert_eq!(key.integration_id, conn.integration_id);
        assert_eq!(key.connection_type, ConnectionType::External);
        assert_eq!(key.account_identifier.as_deref(), Some("acct_1"));
    }
}
