//! Mock implementations for unit testing without a NATS server.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! heron-cron = { path = "...", features = ["test-support"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    config::{DispatchReply, DispatchRequest, Execution, ExecutionFilter, ScheduleConfig},
    dispatch::Dispatcher,
    events::{CronEvent, EventSink},
    lock::{Lease, ScheduleLock},
    store::{ExecutionStore, ScheduleStore},
};

// ── MemoryScheduleStore ───────────────────────────────────────────────────────

/// In-memory `ScheduleStore` shared across clones.
#[derive(Clone, Default)]
pub struct MemoryScheduleStore {
    records: Arc<Mutex<HashMap<String, ScheduleConfig>>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing validation.
    pub async fn seed(&self, schedule: ScheduleConfig) {
        self.records
            .lock()
            .await
            .insert(schedule.id.clone(), schedule);
    }
}

impl ScheduleStore for MemoryScheduleStore {
    type Error = std::convert::Infallible;

    async fn get(&self, id: &str) -> Result<Option<ScheduleConfig>, Self::Error> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ScheduleConfig>, Self::Error> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleConfig>, Self::Error> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn put(&self, schedule: &ScheduleConfig) -> Result<(), Self::Error> {
        self.records
            .lock()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), Self::Error> {
        self.records.lock().await.remove(id);
        Ok(())
    }
}

// ── MemoryExecutionStore ──────────────────────────────────────────────────────

/// In-memory `ExecutionStore` shared across clones.
#[derive(Clone, Default)]
pub struct MemoryExecutionStore {
    records: Arc<Mutex<HashMap<String, Execution>>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored execution, insertion order not guaranteed.
    pub async fn all(&self) -> Vec<Execution> {
        self.records.lock().await.values().cloned().collect()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    type Error = std::convert::Infallible;

    async fn insert(&self, exec: &Execution) -> Result<(), Self::Error> {
        self.records
            .lock()
            .await
            .insert(exec.id.clone(), exec.clone());
        Ok(())
    }

    async fn update(&self, exec: &Execution) -> Result<(), Self::Error> {
        self.insert(exec).await
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, Self::Error> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn query(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, Self::Error> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }
}

// ── MockScheduleLock ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockLockError(pub &'static str);

impl std::fmt::Display for MockLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockLockError {}

/// Controllable per-key lease for testing coordination logic.
///
/// Keys are held in a shared map, so cloning the mock gives independent
/// coordinators a view of the same lock service. `expire` simulates the
/// server purging an entry after its TTL.
#[derive(Clone, Default)]
pub struct MockScheduleLock {
    held: Arc<std::sync::Mutex<HashMap<String, (String, u64)>>>,
    next_revision: Arc<AtomicU64>,
    deny_acquire: Arc<AtomicBool>,
}

impl MockScheduleLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate contention: every `try_acquire` reports the key held.
    pub fn deny_acquire(&self) {
        self.deny_acquire.store(true, Ordering::SeqCst);
    }

    pub fn allow_acquire(&self) {
        self.deny_acquire.store(false, Ordering::SeqCst);
    }

    /// Simulate the server purging an expired entry: the key becomes
    /// acquirable and pending renewals fail.
    pub fn expire(&self, key: &str) {
        self.held.lock().unwrap().remove(key);
    }

    /// Plant a lease held by an arbitrary (possibly crashed) node.
    pub fn force_acquire(&self, key: &str, holder: &str) {
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.held
            .lock()
            .unwrap()
            .insert(key.to_string(), (holder.to_string(), revision));
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().unwrap().contains_key(key)
    }

    pub fn holder_of(&self, key: &str) -> Option<String> {
        self.held.lock().unwrap().get(key).map(|(h, _)| h.clone())
    }
}

impl ScheduleLock for MockScheduleLock {
    type Error = MockLockError;

    async fn try_acquire(&self, key: &str, holder: &str) -> Result<Option<Lease>, MockLockError> {
        if self.deny_acquire.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut held = self.held.lock().unwrap();
        if held.contains_key(key) {
            return Ok(None);
        }
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
        held.insert(key.to_string(), (holder.to_string(), revision));
        Ok(Some(Lease {
            key: key.to_string(),
            revision,
        }))
    }

    async fn renew(&self, lease: &Lease, holder: &str) -> Result<Lease, MockLockError> {
        let mut held = self.held.lock().unwrap();
        match held.get(&lease.key) {
            Some((_, revision)) if *revision == lease.revision => {
                let next = self.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
                held.insert(lease.key.clone(), (holder.to_string(), next));
                Ok(Lease {
                    key: lease.key.clone(),
                    revision: next,
                })
            }
            _ => Err(MockLockError("lease expired or reclaimed")),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), MockLockError> {
        let mut held = self.held.lock().unwrap();
        if let Some((_, revision)) = held.get(&lease.key) {
            if *revision == lease.revision {
                held.remove(&lease.key);
            }
        }
        Ok(())
    }
}

// ── MockDispatcher ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockDispatchError(pub String);

impl std::fmt::Display for MockDispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockDispatchError {}

#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub target: String,
    pub request: DispatchRequest,
}

#[derive(Clone, Default)]
enum DispatchBehavior {
    #[default]
    Accept,
    Reject(String),
    Fail(String),
}

/// Records every dispatch and answers with a configurable reply.
/// Accepts by default.
#[derive(Clone, Default)]
pub struct MockDispatcher {
    records: Arc<std::sync::Mutex<Vec<RecordedDispatch>>>,
    behavior: Arc<std::sync::Mutex<DispatchBehavior>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent dispatch is rejected with this reason.
    pub fn reject(&self, reason: &str) {
        *self.behavior.lock().unwrap() = DispatchBehavior::Reject(reason.to_string());
    }

    /// Every subsequent dispatch fails at the transport level (timeout,
    /// unreachable target).
    pub fn fail(&self, reason: &str) {
        *self.behavior.lock().unwrap() = DispatchBehavior::Fail(reason.to_string());
    }

    pub fn accept(&self) {
        *self.behavior.lock().unwrap() = DispatchBehavior::Accept;
    }

    pub fn requests(&self) -> Vec<RecordedDispatch> {
        self.records.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl Dispatcher for MockDispatcher {
    type Error = MockDispatchError;

    async fn dispatch(
        &self,
        target: &str,
        request: &DispatchRequest,
        _timeout: Duration,
    ) -> Result<DispatchReply, MockDispatchError> {
        self.records.lock().unwrap().push(RecordedDispatch {
            target: target.to_string(),
            request: request.clone(),
        });
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            DispatchBehavior::Fail(reason) => Err(MockDispatchError(reason)),
            DispatchBehavior::Reject(reason) => Ok(DispatchReply {
                accepted: false,
                reason: Some(reason),
            }),
            DispatchBehavior::Accept => Ok(DispatchReply {
                accepted: true,
                reason: None,
            }),
        }
    }
}

// ── MockEventSink ─────────────────────────────────────────────────────────────

/// Records every published lifecycle event.
#[derive(Clone, Default)]
pub struct MockEventSink {
    records: Arc<std::sync::Mutex<Vec<CronEvent>>>,
}

impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CronEvent> {
        self.records.lock().unwrap().clone()
    }

    /// Count of events with the given kind suffix (e.g. "dispatched").
    pub fn count(&self, kind: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

impl EventSink for MockEventSink {
    async fn publish(&self, event: CronEvent) {
        self.records.lock().unwrap().push(event);
    }
}
