//! Missing-Connection Tracker
//!
//! Parks a run on the connections it is missing and notifies the
//! provisioning collaborator once per missing connection, on its first-ever
//! run association. Re-attempts of an already-linked run, and runs that join
//! a missing connection other runs already wait on, do not notify.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::ports::{ActivationStore, ParkCommit, ProvisioningNotifier, Result};
use crate::types::*;

/// What parking a run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Parked {
        run: Run,
        missing: Vec<MissingConnectionKey>,
        /// Missing connections the provisioning collaborator was told about.
        notified: Vec<Uuid>,
    },
    NotActivatable(RunStatus),
}

/// Links that warrant a provisioning notification: the run was newly linked
/// by this transaction and is the only run on the missing connection.
pub fn notifications_due(links: &[MissingConnectionLink]) -> Vec<&MissingConnection> {
    links
        .iter()
        .filter(|link| link.newly_linked && link.run_count == 1)
        .map(|link| &link.missing_connection)
        .collect()
}

/// Park `run_id` on `missing` and notify for first-time missing connections.
///
/// Notification failures are logged and swallowed. The missing connection
/// row stays durable and is not notified again for this run set.
pub async fn track_missing_connections(
    store: &dyn ActivationStore,
    notifier: &dyn ProvisioningNotifier,
    run_id: Uuid,
    missing: &[MissingConnectionKey],
) -> Result<TrackOutcome> {
    let (run, links) = match store.park_run(run_id, missing).await? {
        ParkCommit::Parked { run, links } => (run, links),
        ParkCommit::NotActivatable(status) => return Ok(TrackOutcome::NotActivatable(status)),
    };

    let mut notified = Vec::new();
    for missing_connection in notifications_due(&links) {
        match notifier.missing_connection_created(missing_connection).await {
            Ok(()) => {
                debug!(
                    run_id = %run_id,
                    missing_connection_id = %missing_connection.id,
                    key = %missing_connection.key,
                    "Provisioning notified"
                );
                notified.push(missing_connection.id);
            }
            Err(e) => warn!(
                run_id = %run_id,
                missing_connection_id = %missing_connection.id,
                error = %e,
                "Provisioning notification failed; missing connection remains recorded"
            ),
        }
    }

    Ok(TrackOutcome::Parked {
        run,
        missing: missing.to_vec(),
        notified,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn link(newly_linked: bool, run_count: i64) -> MissingConnectionLink {
        let now = Utc::now();
        MissingConnectionLink {
            missing_connection: MissingConnection {
                id: Uuid::new_v4(),
                key: MissingConnectionKey {
                    integration_id: Uuid::new_v4(),
                    connection_type: ConnectionType::Developer,
                    account_identifier: None,
                },
                resolved: false,
                created_at: now,
                updated_at: now,
            },
            newly_linked,
            run_count,
        }
    }

    #[test]
    fn first_association_notifies() {
        let links = vec![link(true, 1)];
        assert_eq!(notifications_due(&links).len(), 1);
    }

    #[test]
    fn joining_existing_waiters_does_not_notify() {
        let links = vec![link(true, 2), link(true, 5)];
        assert!(notifications_due(&links).is_empty());
    }

    #[test]
    fn re_attempt_of_linked_run_does_not_notify() {
        let links = vec![link(false, 1)];
        assert!(notifications_due(&links).is_empty());
    }

    #[test]
    fn mixed_links_notify_only_first_time_missing() {
        let links = vec![link(true, 1), link(false, 1), link(true, 3)];
        let due = notifications_due(&links);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, links[0].missing_connection.id);
    }
}
