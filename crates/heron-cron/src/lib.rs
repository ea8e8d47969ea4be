//! # heron-cron
//!
//! Distributed cron execution core: fires schedule-defined tasks against
//! execution agents exactly once per fire slot, no matter how many
//! coordinator processes run concurrently.
//!
//! ## How it works
//!
//! - Schedules (5-field cron expression + IANA timezone + target agent)
//!   live in the NATS KV bucket `cron_schedules`, with their fire
//!   bookkeeping (`last_run_at`, `next_run_at`) alongside.
//! - Every coordinator runs the same due-check tick loop; for each due
//!   schedule, whoever wins the per-schedule TTL lease in the `cron_locks`
//!   bucket dispatches, everyone else skips. No global leader, no
//!   inter-coordinator communication.
//! - Dispatch is a request-reply to `agents.<target>.run`: the agent
//!   acknowledges acceptance synchronously and reports completion later on
//!   `cron.completions`. A fire slot is consumed on the dispatch attempt,
//!   not on completion.
//! - Crash safety: a coordinator that dies mid-flight simply stops
//!   renewing its leases; after the TTL they expire and the schedule is
//!   fair game again. An execution whose lease expired before completion
//!   is finalized as failed with a distinct "orphaned" reason.
//! - Lifecycle events (`dispatched`, `completed`, `failed`,
//!   `skipped_lock_contended`) are published to `cron.events.>` for
//!   observers; they are never on the correctness path.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use heron_cron::{CoordinatorConfig, NatsCoordinator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let nats = async_nats::connect("nats://localhost:4222").await.unwrap();
//!     let coordinator = NatsCoordinator::connect(nats.clone(), CoordinatorConfig::default())
//!         .await
//!         .unwrap();
//!     coordinator.run(nats).await.unwrap();
//! }
//! ```
//!
//! ## Schedule example (JSON stored under `schedules.daily-report`)
//!
//! ```json
//! {
//!   "id": "daily-report",
//!   "name": "Daily report",
//!   "target": "reporting-agent",
//!   "expr": "0 9 * * 1-5",
//!   "timezone": "Europe/Berlin",
//!   "payload": { "format": "pdf" },
//!   "enabled": true
//! }
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod kv;
pub mod lock;
pub mod nats_impls;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use client::CronClient;
pub use config::{
    CompletionReport, CoordinatorConfig, DispatchReply, DispatchRequest, Execution,
    ExecutionFilter, ExecutionStatus, NewSchedule, ScheduleConfig, TriggerRequest, TriggerSource,
};
pub use coordinator::{Coordinator, NatsCoordinator, ORPHANED_LOCK_LOST, ORPHANED_SHUTDOWN};
pub use cron::{next_fire_time, CronExpr};
pub use dispatch::Dispatcher;
pub use error::CronError;
pub use events::{CronEvent, EventSink};
pub use lock::{Lease, ScheduleLock};
pub use store::{ExecutionStore, ScheduleStore};
