//! Row structs for runtime-checked queries and their domain conversions.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use activation_core::types::*;

#[derive(Debug, Clone, FromRow)]
pub struct PgRunRow {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub job_version_id: Uuid,
    pub status: String,
    pub external_account_id: Option<String>,
    pub sequence_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
}

impl TryFrom<PgRunRow> for Run {
    type Error = String;

    fn try_from(row: PgRunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.run_id,
            job_id: row.job_id,
            job_version_id: row.job_version_id,
            status: row.status.parse()?,
            external_account_id: row.external_account_id,
            sequence_number: row.sequence_number,
            created_at: row.created_at,
            queued_at: row.queued_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PgRequirementRow {
    pub requirement_key: String,
    pub integration_id: Uuid,
    pub slug: String,
    pub auth_source: String,
}

impl TryFrom<PgRequirementRow> for IntegrationRequirement {
    type Error = String;

    fn try_from(row: PgRequirementRow) -> Result<Self, Self::Error> {
        Ok(IntegrationRequirement {
            key: row.requirement_key,
            integration: Integration {
                id: row.integration_id,
                slug: row.slug,
                auth_source: row.auth_source.parse()?,
            },
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PgConnectionRow {
    pub connection_id: Uuid,
    pub integration_id: Uuid,
    pub connection_type: String,
    pub account_identifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PgConnectionRow> for IntegrationConnection {
    type Error = String;

    fn try_from(row: PgConnectionRow) -> Result<Self, Self::Error> {
        Ok(IntegrationConnection {
            id: row.connection_id,
            integration_id: row.integration_id,
            connection_type: row.connection_type.parse()?,
            account_identifier: row.account_identifier,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PgMissingConnectionRow {
    pub missing_connection_id: Uuid,
    pub integration_id: Uuid,
    pub connection_type: String,
    pub account_identifier: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PgMissingConnectionRow> for MissingConnection {
    type Error = String;

    fn try_from(row: PgMissingConnectionRow) -> Result<Self, Self::Error> {
        Ok(MissingConnection {
            id: row.missing_connection_id,
            key: MissingConnectionKey {
                integration_id: row.integration_id,
                connection_type: row.connection_type.parse()?,
                account_identifier: row.account_identifier,
            },
            resolved: row.resolved,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_row_with_unknown_status_is_rejected() {
        let row = PgRunRow {
            run_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            job_version_id: Uuid::new_v4(),
            status: "EXPLODED".into(),
            external_account_id: None,
            sequence_number: None,
            created_at: Utc::now(),
            queued_at: None,
        };
        let err = Run::try_from(row).unwrap_err();
        assert_eq!(err, "Unknown run status: EXPLODED");
    }

    #[test]
    fn requirement_row_maps_integration() {
        let integration_id = Uuid::new_v4();
        let requirement = IntegrationRequirement::try_from(PgRequirementRow {
            requirement_key: "gh".into(),
            integration_id,
            slug: "github".into(),
            auth_source: "HOSTED".into(),
        })
        .unwrap();
        assert_eq!(requirement.key, "gh");
        assert_eq!(requirement.integration.id, integration_id);
        assert_eq!(requirement.integration.auth_source, AuthSource::Hosted);
    }
}
