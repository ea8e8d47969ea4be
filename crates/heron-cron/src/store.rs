//! Storage seams for schedule definitions and execution records.
//!
//! Traits only — the NATS KV implementations live in [`crate::nats_impls`],
//! in-memory test doubles in [`crate::mocks`]. The coordinator is generic
//! over these so swapping the backing store never changes its contract.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::config::{Execution, ExecutionFilter, ScheduleConfig};

/// Durable record of schedule definitions and their fire bookkeeping.
///
/// `put` writes the full record in one operation. Callers mutating the
/// bookkeeping fields must hold the schedule's lease — the store itself
/// does not arbitrate concurrent writers.
pub trait ScheduleStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<ScheduleConfig>, Self::Error>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<ScheduleConfig>, Self::Error>> + Send;

    /// All enabled schedules with `next_run_at <= now`.
    fn due(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ScheduleConfig>, Self::Error>> + Send;

    fn put(
        &self,
        schedule: &ScheduleConfig,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn remove(&self, id: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Append-oriented store of execution records. Records are inserted at
/// dispatch time, updated on completion, and never deleted by this core.
pub trait ExecutionStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    fn insert(&self, exec: &Execution) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn update(&self, exec: &Execution) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Execution>, Self::Error>> + Send;

    fn query(
        &self,
        filter: &ExecutionFilter,
    ) -> impl Future<Output = Result<Vec<Execution>, Self::Error>> + Send;
}
