use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schedule definition stored in NATS KV under key `schedules.<id>`.
///
/// The bookkeeping fields (`last_run_at`, `next_run_at`) are mutated only by
/// a coordinator holding the schedule's lease; everything else is owned by
/// the admin surface ([`crate::client::CronClient`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Execution target (agent) this schedule dispatches to.
    pub target: String,
    /// Classic 5-field cron expression: minute hour day-of-month month day-of-week.
    pub expr: String,
    /// IANA timezone the expression is evaluated in (e.g. "UTC", "Europe/Berlin").
    pub timezone: String,
    /// Opaque task payload forwarded verbatim in every dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Instant of the most recent dispatch attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next fire instant (UTC). Always `None` while disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ScheduleConfig {
    /// Due means enabled with a fire instant at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|t| t <= now)
    }
}

/// Fields an operator supplies when creating or updating a schedule.
/// Bookkeeping is always computed, never accepted from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub target: String,
    pub expr: String,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
    External,
}

/// One concrete dispatch attempt, stored under `executions.<id>`.
///
/// Created when a dispatch is attempted, finalized by a completion report
/// (or by the orphan path when the lease is lost first). Never deleted by
/// this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    /// `None` for runs not owned by a stored schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    pub target: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trigger: TriggerSource,
}

/// Filter for querying execution records.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub schedule_id: Option<String>,
    pub target: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ExecutionFilter {
    pub fn matches(&self, exec: &Execution) -> bool {
        if let Some(sid) = &self.schedule_id {
            if exec.schedule_id.as_deref() != Some(sid.as_str()) {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if &exec.target != target {
                return false;
            }
        }
        if let Some(status) = self.status {
            if exec.status != status {
                return false;
            }
        }
        if let Some(since) = self.since {
            if exec.started_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if exec.started_at > until {
                return false;
            }
        }
        true
    }
}

/// Request sent to an agent when a schedule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    pub fired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Synchronous accept/reject reply from an agent. Acceptance means the agent
/// took ownership of the work, not that the work finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReply {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Asynchronous completion report published by an agent on `cron.completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub execution_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Manual trigger request published on `cron.trigger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub schedule_id: String,
}

/// Coordinator tuning. Defaults suit minute-granularity cron.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Due-check cadence. Short relative to the coarsest cron granularity.
    pub tick_interval: Duration,
    /// Lease TTL (applied as the lock bucket's `max_age`). Must exceed the
    /// expected dispatch latency by a comfortable margin.
    pub lock_ttl: Duration,
    /// How long to wait for an agent's accept/reject before treating the
    /// dispatch as rejected.
    pub dispatch_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    /// Renewal cadence for in-flight executions: well under half the TTL so
    /// a single missed renewal does not forfeit the lease.
    pub fn renew_interval(&self) -> Duration {
        self.lock_ttl / 3
    }
}
