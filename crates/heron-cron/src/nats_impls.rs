//! Concrete NATS-backed implementations of the seam traits.

use std::time::Duration;

use async_nats::jetstream::kv;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    config::{DispatchReply, DispatchRequest, Execution, ExecutionFilter, ScheduleConfig},
    dispatch::Dispatcher,
    error::CronError,
    events::{CronEvent, EventSink},
    kv::{
        dispatch_subject, snapshot, EVENTS_SUBJECT_PREFIX, EXECUTIONS_KEY_PREFIX,
        EXECUTIONS_WATCH_PATTERN, SCHEDULES_KEY_PREFIX, SCHEDULES_WATCH_PATTERN,
    },
    lock::{Lease, ScheduleLock},
    store::{ExecutionStore, ScheduleStore},
};

// ── KvScheduleStore ───────────────────────────────────────────────────────────

/// `ScheduleStore` backed by the `cron_schedules` KV bucket.
#[derive(Clone)]
pub struct KvScheduleStore {
    kv: kv::Store,
}

impl KvScheduleStore {
    pub fn new(kv: kv::Store) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("{SCHEDULES_KEY_PREFIX}{id}")
    }
}

impl ScheduleStore for KvScheduleStore {
    type Error = CronError;

    async fn get(&self, id: &str) -> Result<Option<ScheduleConfig>, CronError> {
        match self
            .kv
            .entry(Self::key(id))
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?
        {
            Some(entry) if entry.operation == kv::Operation::Put => {
                Ok(Some(serde_json::from_slice(&entry.value)?))
            }
            _ => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<ScheduleConfig>, CronError> {
        snapshot(&self.kv, SCHEDULES_WATCH_PATTERN).await
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleConfig>, CronError> {
        let all = snapshot::<ScheduleConfig>(&self.kv, SCHEDULES_WATCH_PATTERN).await?;
        Ok(all.into_iter().filter(|s| s.is_due(now)).collect())
    }

    async fn put(&self, schedule: &ScheduleConfig) -> Result<(), CronError> {
        let value = serde_json::to_vec(schedule)?;
        self.kv
            .put(Self::key(&schedule.id), value.into())
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), CronError> {
        self.kv
            .delete(Self::key(id))
            .await
            .map_err(|e| CronError::Kv(e.to_string()))
    }
}

// ── KvExecutionStore ──────────────────────────────────────────────────────────

/// `ExecutionStore` backed by the `cron_executions` KV bucket.
#[derive(Clone)]
pub struct KvExecutionStore {
    kv: kv::Store,
}

impl KvExecutionStore {
    pub fn new(kv: kv::Store) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("{EXECUTIONS_KEY_PREFIX}{id}")
    }

    async fn put(&self, exec: &Execution) -> Result<(), CronError> {
        let value = serde_json::to_vec(exec)?;
        self.kv
            .put(Self::key(&exec.id), value.into())
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?;
        Ok(())
    }
}

impl ExecutionStore for KvExecutionStore {
    type Error = CronError;

    async fn insert(&self, exec: &Execution) -> Result<(), CronError> {
        self.put(exec).await
    }

    async fn update(&self, exec: &Execution) -> Result<(), CronError> {
        self.put(exec).await
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, CronError> {
        match self
            .kv
            .entry(Self::key(id))
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?
        {
            Some(entry) if entry.operation == kv::Operation::Put => {
                Ok(Some(serde_json::from_slice(&entry.value)?))
            }
            _ => Ok(None),
        }
    }

    async fn query(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, CronError> {
        let all = snapshot::<Execution>(&self.kv, EXECUTIONS_WATCH_PATTERN).await?;
        Ok(all.into_iter().filter(|e| filter.matches(e)).collect())
    }
}

// ── KvScheduleLock ────────────────────────────────────────────────────────────

/// Per-schedule lease over the `cron_locks` KV bucket.
///
/// `create` is the atomic set-if-absent; the bucket's `max_age` is the TTL;
/// `update` with the acquisition revision is the CAS renew. A renew after
/// expiry fails even if another holder has since re-created the key,
/// because the revision moved on.
#[derive(Clone)]
pub struct KvScheduleLock {
    kv: kv::Store,
}

impl KvScheduleLock {
    pub fn new(kv: kv::Store) -> Self {
        Self { kv }
    }
}

impl ScheduleLock for KvScheduleLock {
    type Error = CronError;

    async fn try_acquire(&self, key: &str, holder: &str) -> Result<Option<Lease>, CronError> {
        match self.kv.create(key, Bytes::from(holder.to_string())).await {
            Ok(revision) => Ok(Some(Lease {
                key: key.to_string(),
                revision,
            })),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                // Another coordinator holds the lease — expected, not an error.
                Ok(None)
            }
            Err(e) => Err(CronError::Kv(e.to_string())),
        }
    }

    async fn renew(&self, lease: &Lease, holder: &str) -> Result<Lease, CronError> {
        let revision = self
            .kv
            .update(&lease.key, Bytes::from(holder.to_string()), lease.revision)
            .await
            .map_err(|e| CronError::Kv(e.to_string()))?;
        Ok(Lease {
            key: lease.key.clone(),
            revision,
        })
    }

    async fn release(&self, lease: &Lease) -> Result<(), CronError> {
        // Revision-guarded delete: never removes a lease that expired and
        // was re-acquired by another holder.
        self.kv
            .delete_expect_revision(&lease.key, Some(lease.revision))
            .await
            .map_err(|e| CronError::Kv(e.to_string()))
    }
}

// ── NatsDispatcher ────────────────────────────────────────────────────────────

/// Request-reply dispatch to `agents.<target>.run`.
#[derive(Clone)]
pub struct NatsDispatcher {
    client: async_nats::Client,
}

impl NatsDispatcher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

impl Dispatcher for NatsDispatcher {
    type Error = CronError;

    async fn dispatch(
        &self,
        target: &str,
        request: &DispatchRequest,
        timeout: Duration,
    ) -> Result<DispatchReply, CronError> {
        let subject = dispatch_subject(target);
        let payload = serde_json::to_vec(request)?;

        let response = tokio::time::timeout(
            timeout,
            self.client.request(subject.clone(), payload.into()),
        )
        .await
        .map_err(|_| CronError::Dispatch(format!("target '{target}' did not answer within {timeout:?}")))?
        .map_err(|e| CronError::Dispatch(format!("request to '{subject}' failed: {e}")))?;

        Ok(serde_json::from_slice(&response.payload)?)
    }
}

// ── NatsEventSink ─────────────────────────────────────────────────────────────

/// Publishes lifecycle events as JSON to `cron.events.<kind>`. Failures are
/// logged and swallowed — events never gate the dispatch path.
#[derive(Clone)]
pub struct NatsEventSink {
    client: async_nats::Client,
}

impl NatsEventSink {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

impl EventSink for NatsEventSink {
    async fn publish(&self, event: CronEvent) {
        let subject = format!("{EVENTS_SUBJECT_PREFIX}{}", event.kind());
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize lifecycle event");
                return;
            }
        };
        if let Err(e) = self.client.publish(subject.clone(), payload.into()).await {
            tracing::warn!(subject, error = %e, "Failed to publish lifecycle event");
        }
    }
}
