//! Per-schedule distributed lease.
//!
//! One key per schedule id, TTL-bounded by the backing store. Acquisition
//! is atomic set-if-absent; renewal is a compare-and-set keyed on the
//! revision handed out at acquisition, so a process that lost its lease
//! can never renew a lease now held by someone else.

use std::future::Future;

/// Proof of a held lease: the key plus the CAS token for renew/release.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub revision: u64,
}

/// Distributed mutual exclusion, one lease per schedule.
///
/// Contention is a normal outcome, not an error: `try_acquire` returns
/// `Ok(None)` when another holder has the key, and `Err` only when the
/// coordination backend itself failed. The lease TTL is a property of the
/// backing bucket (see [`crate::kv::get_or_create_locks_bucket`]); expiry
/// without renewal makes the key acquirable by any other process.
pub trait ScheduleLock: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    /// Atomically claim `key` for `holder`. `Ok(Some(lease))` on success,
    /// `Ok(None)` if the key is currently held.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
    ) -> impl Future<Output = Result<Option<Lease>, Self::Error>> + Send;

    /// Extend a held lease's TTL. Fails if the lease expired or was
    /// reclaimed since acquisition (the CAS token no longer matches).
    fn renew(
        &self,
        lease: &Lease,
        holder: &str,
    ) -> impl Future<Output = Result<Lease, Self::Error>> + Send;

    /// Best-effort release. Safe to skip (crash) — TTL expiry reclaims the
    /// key; callers log and ignore errors.
    fn release(&self, lease: &Lease) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
