//! Admin client for the schedule store: CRUD, enable/disable, manual
//! triggers, and execution queries.
//!
//! Multiple processes can use `CronClient` simultaneously — running
//! coordinators observe schedule changes on their next tick, and a delete
//! or disable is honored even for a schedule whose lease is already held
//! (the coordinator re-validates after acquisition).

use chrono::Utc;

use crate::{
    config::{Execution, ExecutionFilter, NewSchedule, ScheduleConfig, TriggerRequest},
    cron,
    error::CronError,
    kv::{get_or_create_executions_bucket, get_or_create_schedules_bucket, TRIGGER_SUBJECT},
    nats_impls::{KvExecutionStore, KvScheduleStore},
    store::{ExecutionStore, ScheduleStore},
};

/// # Example
///
/// ```rust,no_run
/// use heron_cron::{CronClient, NewSchedule};
///
/// # async fn example() -> Result<(), heron_cron::CronError> {
/// let nats = async_nats::connect("nats://localhost:4222").await.unwrap();
/// let client = CronClient::new(nats).await?;
///
/// client.create_schedule(NewSchedule {
///     id: "daily-report".to_string(),
///     name: "Daily report".to_string(),
///     description: None,
///     target: "reporting-agent".to_string(),
///     expr: "0 9 * * 1-5".to_string(),
///     timezone: "Europe/Berlin".to_string(),
///     payload: Some(serde_json::json!({ "format": "pdf" })),
///     enabled: true,
/// }).await?;
/// # Ok(())
/// # }
/// ```
pub struct CronClient {
    nats: async_nats::Client,
    schedules: KvScheduleStore,
    executions: KvExecutionStore,
}

impl CronClient {
    /// Connect the client and ensure the backing KV buckets exist.
    pub async fn new(nats: async_nats::Client) -> Result<Self, CronError> {
        let js = async_nats::jetstream::new(nats.clone());
        let schedules = KvScheduleStore::new(get_or_create_schedules_bucket(&js).await?);
        let executions = KvExecutionStore::new(get_or_create_executions_bucket(&js).await?);
        Ok(Self {
            nats,
            schedules,
            executions,
        })
    }

    /// Create a schedule. Rejects duplicates and anything that fails eager
    /// validation — malformed definitions are never stored.
    pub async fn create_schedule(&self, new: NewSchedule) -> Result<ScheduleConfig, CronError> {
        validate_definition(&new)?;
        if self.schedules.get(&new.id).await?.is_some() {
            return Err(CronError::InvalidSchedule {
                reason: format!("schedule '{}' already exists", new.id),
            });
        }
        let schedule = materialize(new)?;
        self.schedules.put(&schedule).await?;
        tracing::info!(schedule_id = %schedule.id, "Schedule created");
        Ok(schedule)
    }

    /// Replace an existing schedule's definition. Bookkeeping is recomputed
    /// from the current instant; the previous `last_run_at` is preserved.
    pub async fn update_schedule(&self, new: NewSchedule) -> Result<ScheduleConfig, CronError> {
        validate_definition(&new)?;
        let existing = self
            .schedules
            .get(&new.id)
            .await?
            .ok_or_else(|| CronError::ScheduleNotFound { id: new.id.clone() })?;
        let mut schedule = materialize(new)?;
        schedule.last_run_at = existing.last_run_at;
        self.schedules.put(&schedule).await?;
        tracing::info!(schedule_id = %schedule.id, "Schedule updated");
        Ok(schedule)
    }

    /// Remove a schedule. No-op if it doesn't exist. A coordinator holding
    /// the schedule's lease detects the deletion before dispatching.
    pub async fn remove_schedule(&self, id: &str) -> Result<(), CronError> {
        self.schedules.remove(id).await?;
        tracing::info!(schedule_id = %id, "Schedule removed");
        Ok(())
    }

    /// Enable or disable without changing the definition. Enabling
    /// recomputes `next_run_at` from now; disabling clears it.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduleConfig, CronError> {
        let mut schedule = self
            .schedules
            .get(id)
            .await?
            .ok_or_else(|| CronError::ScheduleNotFound { id: id.to_string() })?;
        schedule.enabled = enabled;
        schedule.next_run_at = if enabled {
            Some(cron::next_fire_time(
                &schedule.expr,
                &schedule.timezone,
                Utc::now(),
            )?)
        } else {
            None
        };
        self.schedules.put(&schedule).await?;
        tracing::info!(schedule_id = %id, enabled, "Schedule toggled");
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleConfig>, CronError> {
        self.schedules.get(id).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>, CronError> {
        self.schedules.list().await
    }

    /// Request an out-of-band run. The dispatch is arbitrated by the same
    /// per-schedule lease as scheduled fires and leaves `next_run_at`
    /// untouched.
    pub async fn trigger(&self, id: &str) -> Result<(), CronError> {
        if self.schedules.get(id).await?.is_none() {
            return Err(CronError::ScheduleNotFound { id: id.to_string() });
        }
        let payload = serde_json::to_vec(&TriggerRequest {
            schedule_id: id.to_string(),
        })?;
        self.nats
            .publish(TRIGGER_SUBJECT, payload.into())
            .await
            .map_err(|e| CronError::Dispatch(format!("trigger publish failed: {e}")))?;
        tracing::info!(schedule_id = %id, "Manual trigger requested");
        Ok(())
    }

    /// Query execution records by schedule, target, status, and time range.
    pub async fn executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, CronError> {
        self.executions.query(filter).await
    }
}

/// Eager validation of an operator-supplied definition. Everything here is
/// rejected synchronously at create/update time, never silently coerced.
fn validate_definition(new: &NewSchedule) -> Result<(), CronError> {
    if new.id.is_empty()
        || !new
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CronError::InvalidSchedule {
            reason: format!("id '{}' must be non-empty [A-Za-z0-9_-]", new.id),
        });
    }
    if new.target.is_empty()
        || new
            .target
            .chars()
            .any(|c| c.is_whitespace() || c == '.' || c == '*' || c == '>')
    {
        return Err(CronError::InvalidSchedule {
            reason: format!("target '{}' is not a valid subject token", new.target),
        });
    }
    if new.name.is_empty() {
        return Err(CronError::InvalidSchedule {
            reason: "name must not be empty".to_string(),
        });
    }
    cron::validate(&new.expr, &new.timezone)
}

/// Turn a validated definition into a stored record, computing the initial
/// bookkeeping. `next_run_at` is strictly future, and absent while disabled.
fn materialize(new: NewSchedule) -> Result<ScheduleConfig, CronError> {
    let next_run_at = if new.enabled {
        Some(cron::next_fire_time(&new.expr, &new.timezone, Utc::now())?)
    } else {
        None
    };
    Ok(ScheduleConfig {
        id: new.id,
        name: new.name,
        description: new.description,
        target: new.target,
        expr: new.expr,
        timezone: new.timezone,
        payload: new.payload,
        enabled: new.enabled,
        last_run_at: None,
        next_run_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> NewSchedule {
        NewSchedule {
            id: "daily-report".to_string(),
            name: "Daily report".to_string(),
            description: None,
            target: "reporting-agent".to_string(),
            expr: "0 9 * * *".to_string(),
            timezone: "UTC".to_string(),
            payload: None,
            enabled: true,
        }
    }

    #[test]
    fn valid_definition_passes() {
        assert!(validate_definition(&definition()).is_ok());
    }

    #[test]
    fn malformed_cron_is_rejected() {
        let mut new = definition();
        new.expr = "61 * * * *".to_string();
        assert!(matches!(
            validate_definition(&new),
            Err(CronError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let mut new = definition();
        new.timezone = "Atlantis/Capital".to_string();
        assert!(matches!(
            validate_definition(&new),
            Err(CronError::InvalidTimezone { .. })
        ));
    }

    #[test]
    fn bad_ids_and_targets_are_rejected() {
        for id in ["", "has space", "dot.ted", "wild*card"] {
            let mut new = definition();
            new.id = id.to_string();
            assert!(validate_definition(&new).is_err(), "id '{id}' should fail");
        }
        for target in ["", "has space", "dot.ted", "wild*card", "tail>"] {
            let mut new = definition();
            new.target = target.to_string();
            assert!(
                validate_definition(&new).is_err(),
                "target '{target}' should fail"
            );
        }
    }

    #[test]
    fn enabled_definition_gets_future_next_run() {
        let before = Utc::now();
        let schedule = materialize(definition()).unwrap();
        assert!(schedule.next_run_at.unwrap() > before);
        assert!(schedule.last_run_at.is_none());
    }

    #[test]
    fn disabled_definition_has_no_next_run() {
        let mut new = definition();
        new.enabled = false;
        let schedule = materialize(new).unwrap();
        assert!(schedule.next_run_at.is_none());
    }
}
