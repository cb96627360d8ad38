//! Run sequencer lock keys.
//!
//! Sequence numbers are assigned by the store inside the queue transition:
//! take an exclusive transaction-scoped advisory lock keyed by
//! [`job_lock_key`], upsert the job counter (create at 1 or increment) and
//! read the new value back. The lock is released by commit or rollback; there
//! is no explicit unlock.
//!
//! Distinct jobs that hash to the same key only serialize against each other.
//! Counters stay per-job, so a collision never affects sequence numbers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace mixed into the digest so job locks do not share a key space
/// with other advisory locks taken on the same database.
const LOCK_NAMESPACE: &[u8] = b"run-activation:job-sequence:";

/// Advisory lock key for a job's sequence counter.
///
/// SHA-256 of the namespaced job id, first eight bytes read big-endian as a
/// signed 64-bit integer (the domain of `pg_advisory_xact_lock(bigint)`).
pub fn job_lock_key(job_id: Uuid) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(LOCK_NAMESPACE);
    hasher.update(job_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable() {
        let job_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(job_lock_key(job_id), job_lock_key(job_id));
    }

    #[test]
    fn lock_key_differs_between_jobs() {
        let a = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let b = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        assert_ne!(job_lock_key(a), job_lock_key(b));
    }

    #[test]
    fn lock_key_matches_digest_prefix() {
        let job_id = Uuid::nil();
        let mut hasher = Sha256::new();
        hasher.update(b"run-activation:job-sequence:");
        hasher.update([0u8; 16]);
        let digest = hasher.finalize();
        let expected = i64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        assert_eq!(job_lock_key(job_id), expected);
    }

    #[test]
    fn lock_keys_spread_over_many_jobs() {
        let keys: std::collections::HashSet<i64> =
            (0..1000).map(|_| job_lock_key(Uuid::new_v4())).collect();
        assert_eq!(keys.len(), 1000);
    }
}
