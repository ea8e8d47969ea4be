//! The coordinating loop: polls for due schedules, arbitrates per-schedule
//! leases, dispatches to agents, and keeps the fire bookkeeping honest.
//!
//! Any number of coordinator processes may run concurrently. They never
//! talk to each other — leadership is decided per schedule per tick by
//! whoever wins the lease, and the loser's skip is a benign, debug-logged
//! non-event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    config::{
        CompletionReport, CoordinatorConfig, DispatchRequest, Execution, ExecutionStatus,
        ScheduleConfig, TriggerRequest, TriggerSource,
    },
    cron::next_fire_time,
    dispatch::Dispatcher,
    error::CronError,
    events::{CronEvent, EventSink},
    kv::{
        get_or_create_executions_bucket, get_or_create_locks_bucket,
        get_or_create_schedules_bucket, COMPLETIONS_SUBJECT, TRIGGER_SUBJECT,
    },
    lock::{Lease, ScheduleLock},
    nats_impls::{KvExecutionStore, KvScheduleLock, KvScheduleStore, NatsDispatcher, NatsEventSink},
    store::{ExecutionStore, ScheduleStore},
};

/// Error detail recorded when a lease expired before the completion report
/// arrived. Distinct from ordinary dispatch failures so operators can tell
/// "the work failed" from "we lost track of it".
pub const ORPHANED_LOCK_LOST: &str = "orphaned: lock lost before completion";
/// Error detail recorded when the coordinator shuts down with work in flight.
pub const ORPHANED_SHUTDOWN: &str = "orphaned: coordinator shut down before completion";

/// Bookkeeping for an execution this process dispatched and is still
/// tracking: the live lease (revision moves on every renew) and whether a
/// renew has failed since dispatch.
struct InFlight {
    schedule_id: Option<String>,
    lease: Arc<Mutex<Lease>>,
    lock_lost: Arc<AtomicBool>,
    renew_task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Coordinator<S, X, L, D, E>
where
    S: ScheduleStore,
    X: ExecutionStore,
    L: ScheduleLock,
    D: Dispatcher,
    E: EventSink,
{
    config: CoordinatorConfig,
    node_id: String,
    schedules: S,
    executions: X,
    lock: L,
    dispatcher: D,
    events: E,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl<S, X, L, D, E> Coordinator<S, X, L, D, E>
where
    S: ScheduleStore,
    X: ExecutionStore,
    L: ScheduleLock,
    D: Dispatcher,
    E: EventSink,
{
    pub fn new(
        config: CoordinatorConfig,
        schedules: S,
        executions: X,
        lock: L,
        dispatcher: D,
        events: E,
    ) -> Self {
        Self {
            config,
            node_id: Uuid::new_v4().to_string(),
            schedules,
            executions,
            lock,
            dispatcher,
            events,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// One due-check pass: query the store and fan out one task per due
    /// schedule. Lease arbitration (not this method) prevents duplicates,
    /// both across processes and across overlapping ticks of this one.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = match self.schedules.due(now).await {
            Ok(due) => due,
            Err(e) => {
                // Store outage: fire nothing this tick rather than fire
                // without coordination. The next tick re-evaluates.
                tracing::error!(error = %e, "Due-schedule query failed, skipping tick");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "Due schedules this tick");
        for schedule in due {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator
                    .fire(&schedule.id, TriggerSource::Schedule)
                    .await;
            });
        }
    }

    /// Attempt one dispatch for `schedule_id`: lease → re-validate →
    /// dispatch → record. All failures are isolated to this schedule.
    pub async fn fire(&self, schedule_id: &str, trigger: TriggerSource) {
        let lease = match self.lock.try_acquire(schedule_id, &self.node_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                // A peer claimed this schedule (or a prior run of ours is
                // still holding the lease). Expected; never retried this tick.
                tracing::debug!(schedule_id, "Lease contended, skipping");
                self.events
                    .publish(CronEvent::SkippedLockContended {
                        schedule_id: schedule_id.to_string(),
                        at: Utc::now(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(schedule_id, error = %e, "Lease backend unavailable, skipping until next tick");
                return;
            }
        };

        // Re-read after acquisition: an administrative delete or disable may
        // have landed between the due-check and winning the lease.
        let schedule = match self.schedules.get(schedule_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::debug!(schedule_id, "Schedule deleted after lease acquisition, aborting");
                self.release(&lease).await;
                return;
            }
            Err(e) => {
                tracing::error!(schedule_id, error = %e, "Schedule re-read failed, aborting dispatch");
                self.release(&lease).await;
                return;
            }
        };
        // Manual triggers run even while disabled; scheduled fires do not.
        if trigger == TriggerSource::Schedule && !schedule.enabled {
            tracing::debug!(schedule_id, "Schedule disabled after lease acquisition, aborting");
            self.release(&lease).await;
            return;
        }

        let now = Utc::now();
        let execution_id = Uuid::new_v4().to_string();
        let request = DispatchRequest {
            execution_id: execution_id.clone(),
            schedule_id: Some(schedule.id.clone()),
            fired_at: now,
            payload: schedule.payload.clone(),
        };

        let reply = self
            .dispatcher
            .dispatch(&schedule.target, &request, self.config.dispatch_timeout)
            .await;

        // A fire slot is consumed by the attempt, accepted or not, so a
        // broken target cannot re-fire the same slot every tick. Manual
        // triggers are additional runs and leave the bookkeeping alone.
        if trigger == TriggerSource::Schedule {
            self.advance_bookkeeping(schedule.clone(), now).await;
        }

        match reply {
            Ok(reply) if reply.accepted => {
                let execution = Execution {
                    id: execution_id.clone(),
                    schedule_id: Some(schedule.id.clone()),
                    target: schedule.target.clone(),
                    status: ExecutionStatus::Running,
                    started_at: now,
                    finished_at: None,
                    error: None,
                    trigger,
                };
                if let Err(e) = self.executions.insert(&execution).await {
                    tracing::error!(execution_id, error = %e, "Failed to record execution");
                }
                self.track(execution_id.clone(), Some(schedule.id.clone()), lease)
                    .await;
                tracing::info!(
                    schedule_id = %schedule.id,
                    execution_id = %execution_id,
                    target = %schedule.target,
                    "Dispatched"
                );
                self.events
                    .publish(CronEvent::Dispatched {
                        schedule_id: Some(schedule.id),
                        execution_id,
                        target: schedule.target,
                        at: now,
                    })
                    .await;
            }
            Ok(reply) => {
                let reason = reply
                    .reason
                    .unwrap_or_else(|| "target rejected dispatch".to_string());
                self.record_failed_dispatch(&schedule, &execution_id, now, reason, trigger)
                    .await;
                self.release(&lease).await;
            }
            Err(e) => {
                self.record_failed_dispatch(&schedule, &execution_id, now, e.to_string(), trigger)
                    .await;
                self.release(&lease).await;
            }
        }
    }

    /// Manual trigger: same lease-arbitrated path, bypasses the due-check
    /// and the enabled flag, never touches `next_run_at`.
    pub async fn trigger_now(&self, schedule_id: &str) {
        self.fire(schedule_id, TriggerSource::Manual).await;
    }

    /// Finalize an execution from an agent's completion report. Reports for
    /// executions this process is not tracking belong to a peer coordinator
    /// and are ignored.
    pub async fn handle_completion(&self, report: CompletionReport) {
        let entry = self.in_flight.lock().await.remove(&report.execution_id);
        let Some(entry) = entry else {
            tracing::debug!(execution_id = %report.execution_id, "Completion for untracked execution, ignoring");
            return;
        };
        entry.renew_task.abort();
        let lock_lost = entry.lock_lost.load(Ordering::SeqCst);

        let mut execution = match self.executions.get(&report.execution_id).await {
            Ok(Some(e)) => e,
            Ok(None) => {
                tracing::warn!(execution_id = %report.execution_id, "Completion for unknown execution record");
                return;
            }
            Err(e) => {
                tracing::error!(execution_id = %report.execution_id, error = %e, "Execution lookup failed");
                return;
            }
        };

        let finished_at = Utc::now();
        execution.finished_at = Some(finished_at);
        if lock_lost {
            // The lease expired before completion was observed: coordination
            // failed even if the task itself succeeded.
            execution.status = ExecutionStatus::Failed;
            execution.error = Some(ORPHANED_LOCK_LOST.to_string());
        } else if report.success {
            execution.status = ExecutionStatus::Success;
            execution.error = None;
        } else {
            execution.status = ExecutionStatus::Failed;
            execution.error = Some(
                report
                    .error
                    .unwrap_or_else(|| "target reported failure".to_string()),
            );
        }

        if let Err(e) = self.executions.update(&execution).await {
            tracing::error!(execution_id = %execution.id, error = %e, "Failed to finalize execution");
        }

        if !lock_lost {
            let lease = entry.lease.lock().await.clone();
            self.release(&lease).await;
        }

        match execution.status {
            ExecutionStatus::Success => {
                tracing::info!(execution_id = %execution.id, "Execution completed");
                self.events
                    .publish(CronEvent::Completed {
                        schedule_id: entry.schedule_id,
                        execution_id: execution.id,
                        at: finished_at,
                    })
                    .await;
            }
            _ => {
                let error = execution.error.clone().unwrap_or_default();
                tracing::warn!(execution_id = %execution.id, error = %error, "Execution failed");
                self.events
                    .publish(CronEvent::Failed {
                        schedule_id: entry.schedule_id,
                        execution_id: execution.id,
                        error,
                        at: finished_at,
                    })
                    .await;
            }
        }
    }

    /// Release every held lease and mark still-running executions orphaned.
    /// Called on graceful shutdown.
    pub async fn drain(&self) {
        let entries: Vec<(String, InFlight)> = self.in_flight.lock().await.drain().collect();
        for (execution_id, entry) in entries {
            entry.renew_task.abort();
            if let Ok(Some(mut execution)) = self.executions.get(&execution_id).await {
                if matches!(
                    execution.status,
                    ExecutionStatus::Pending | ExecutionStatus::Running
                ) {
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(ORPHANED_SHUTDOWN.to_string());
                    execution.finished_at = Some(Utc::now());
                    if let Err(e) = self.executions.update(&execution).await {
                        tracing::error!(execution_id, error = %e, "Failed to orphan execution on shutdown");
                    }
                }
            }
            if !entry.lock_lost.load(Ordering::SeqCst) {
                let lease = entry.lease.lock().await.clone();
                self.release(&lease).await;
            }
        }
    }

    /// Number of executions this process is currently tracking.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    // ── internals ─────────────────────────────────────────────────────────

    /// Advance `last_run_at`/`next_run_at` in a single full-record write,
    /// made while this process holds the schedule's lease.
    async fn advance_bookkeeping(&self, mut schedule: ScheduleConfig, dispatched_at: DateTime<Utc>) {
        schedule.last_run_at = Some(dispatched_at);
        schedule.next_run_at = match next_fire_time(&schedule.expr, &schedule.timezone, dispatched_at)
        {
            Ok(next) => Some(next),
            Err(e) => {
                // Expressions are validated at create/update time; reaching
                // this means the stored record was corrupted out-of-band.
                tracing::error!(schedule_id = %schedule.id, error = %e, "Cannot compute next fire time");
                None
            }
        };
        if let Err(e) = self.schedules.put(&schedule).await {
            tracing::error!(schedule_id = %schedule.id, error = %e, "Failed to advance schedule bookkeeping");
        }
    }

    async fn record_failed_dispatch(
        &self,
        schedule: &ScheduleConfig,
        execution_id: &str,
        started_at: DateTime<Utc>,
        reason: String,
        trigger: TriggerSource,
    ) {
        tracing::warn!(
            schedule_id = %schedule.id,
            target = %schedule.target,
            error = %reason,
            "Dispatch rejected"
        );
        let execution = Execution {
            id: execution_id.to_string(),
            schedule_id: Some(schedule.id.clone()),
            target: schedule.target.clone(),
            status: ExecutionStatus::Failed,
            started_at,
            finished_at: Some(Utc::now()),
            error: Some(reason.clone()),
            trigger,
        };
        if let Err(e) = self.executions.insert(&execution).await {
            tracing::error!(execution_id, error = %e, "Failed to record rejected dispatch");
        }
        self.events
            .publish(CronEvent::Failed {
                schedule_id: Some(schedule.id.clone()),
                execution_id: execution_id.to_string(),
                error: reason,
                at: started_at,
            })
            .await;
    }

    /// Register an accepted execution and start its renewal task. The task
    /// renews at a cadence well under half the TTL; the first failed renew
    /// marks the entry lock-lost and stops renewing.
    async fn track(&self, execution_id: String, schedule_id: Option<String>, lease: Lease) {
        let lease_slot = Arc::new(Mutex::new(lease));
        let lock_lost = Arc::new(AtomicBool::new(false));

        let renew_task = tokio::spawn({
            let lock = self.lock.clone();
            let node_id = self.node_id.clone();
            let lease_slot = Arc::clone(&lease_slot);
            let lock_lost = Arc::clone(&lock_lost);
            let interval = self.config.renew_interval();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    let current = lease_slot.lock().await.clone();
                    match lock.renew(&current, &node_id).await {
                        Ok(renewed) => {
                            *lease_slot.lock().await = renewed;
                        }
                        Err(e) => {
                            tracing::warn!(key = %current.key, error = %e, "Lease renewal failed, lease lost");
                            lock_lost.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
        });

        self.in_flight.lock().await.insert(
            execution_id,
            InFlight {
                schedule_id,
                lease: lease_slot,
                lock_lost,
                renew_task,
            },
        );
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.lock.release(lease).await {
            // Safe to ignore: TTL expiry reclaims the key regardless.
            tracing::warn!(key = %lease.key, error = %e, "Failed to release lease");
        }
    }
}

// ── NATS wiring ───────────────────────────────────────────────────────────────

pub type NatsCoordinator =
    Coordinator<KvScheduleStore, KvExecutionStore, KvScheduleLock, NatsDispatcher, NatsEventSink>;

impl NatsCoordinator {
    /// Bootstrap the KV buckets and build a coordinator wired to NATS.
    pub async fn connect(
        client: async_nats::Client,
        config: CoordinatorConfig,
    ) -> Result<Self, CronError> {
        let js = async_nats::jetstream::new(client.clone());
        let schedules = KvScheduleStore::new(get_or_create_schedules_bucket(&js).await?);
        let executions = KvExecutionStore::new(get_or_create_executions_bucket(&js).await?);
        let lock = KvScheduleLock::new(get_or_create_locks_bucket(&js, config.lock_ttl).await?);
        Ok(Self::new(
            config,
            schedules,
            executions,
            lock,
            NatsDispatcher::new(client.clone()),
            NatsEventSink::new(client),
        ))
    }

    /// Run until SIGINT / SIGTERM: due-check ticks, manual triggers, and
    /// completion reports, all in one select loop.
    pub async fn run(self, client: async_nats::Client) -> Result<(), CronError> {
        let mut trigger_sub = client
            .subscribe(TRIGGER_SUBJECT)
            .await
            .map_err(|e| CronError::Dispatch(format!("subscribe {TRIGGER_SUBJECT}: {e}")))?;
        let mut completion_sub = client
            .subscribe(COMPLETIONS_SUBJECT)
            .await
            .map_err(|e| CronError::Dispatch(format!("subscribe {COMPLETIONS_SUBJECT}: {e}")))?;

        tracing::info!(
            node_id = %self.node_id,
            tick_interval = ?self.config.tick_interval,
            lock_ttl = ?self.config.lock_ttl,
            "Coordinator starting"
        );

        let mut tick = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown_signal() => {
                    tracing::info!("Shutdown signal received, draining leases");
                    self.drain().await;
                    break;
                }

                _ = tick.tick() => {
                    self.tick(Utc::now()).await;
                }

                Some(msg) = trigger_sub.next() => {
                    match serde_json::from_slice::<TriggerRequest>(&msg.payload) {
                        Ok(req) => {
                            let coordinator = self.clone();
                            tokio::spawn(async move {
                                coordinator.trigger_now(&req.schedule_id).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "Malformed trigger request"),
                    }
                }

                Some(msg) = completion_sub.next() => {
                    match serde_json::from_slice::<CompletionReport>(&msg.payload) {
                        Ok(report) => self.handle_completion(report).await,
                        Err(e) => tracing::warn!(error = %e, "Malformed completion report"),
                    }
                }
            }
        }

        Ok(())
    }
}

/// Resolves when the process receives a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix both signals are handled so container orchestrators (`docker stop`,
/// Kubernetes pod termination) trigger a clean lease drain. On non-Unix only
/// Ctrl-C (SIGINT) is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c  => {}
        _ = sigterm => {}
    }
}
