//! Lifecycle event broadcasting. Observability only — never on the
//! correctness path, never allowed to block or fail a dispatch.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronEvent {
    Dispatched {
        schedule_id: Option<String>,
        execution_id: String,
        target: String,
        at: DateTime<Utc>,
    },
    Completed {
        schedule_id: Option<String>,
        execution_id: String,
        at: DateTime<Utc>,
    },
    Failed {
        schedule_id: Option<String>,
        execution_id: String,
        error: String,
        at: DateTime<Utc>,
    },
    SkippedLockContended {
        schedule_id: String,
        at: DateTime<Utc>,
    },
}

impl CronEvent {
    /// Subject suffix this event is published under (`cron.events.<kind>`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::SkippedLockContended { .. } => "skipped_lock_contended",
        }
    }
}

/// Fire-and-forget event publication. Implementations must swallow their
/// own failures (log at `warn!`), so the signature is infallible.
pub trait EventSink: Send + Sync + Clone + 'static {
    fn publish(&self, event: CronEvent) -> impl Future<Output = ()> + Send;
}
