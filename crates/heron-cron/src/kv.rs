//! NATS JetStream KV bootstrap: bucket names, key layout, TTL wiring.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use futures::StreamExt;

use crate::error::CronError;

pub const SCHEDULES_BUCKET: &str = "cron_schedules";
pub const EXECUTIONS_BUCKET: &str = "cron_executions";
pub const LOCKS_BUCKET: &str = "cron_locks";

pub const SCHEDULES_KEY_PREFIX: &str = "schedules.";
pub const SCHEDULES_WATCH_PATTERN: &str = "schedules.*";
pub const EXECUTIONS_KEY_PREFIX: &str = "executions.";
pub const EXECUTIONS_WATCH_PATTERN: &str = "executions.*";

/// Subject agents are dispatched on: `agents.<target>.run`.
pub fn dispatch_subject(target: &str) -> String {
    format!("agents.{target}.run")
}

/// Completion reports from agents.
pub const COMPLETIONS_SUBJECT: &str = "cron.completions";
/// Manual trigger requests from the admin surface.
pub const TRIGGER_SUBJECT: &str = "cron.trigger";
/// Lifecycle event subjects: `cron.events.<kind>`.
pub const EVENTS_SUBJECT_PREFIX: &str = "cron.events.";

pub async fn get_or_create_schedules_bucket(
    js: &jetstream::Context,
) -> Result<kv::Store, CronError> {
    get_or_create(
        js,
        kv::Config {
            bucket: SCHEDULES_BUCKET.to_string(),
            history: 5,
            ..Default::default()
        },
    )
    .await
}

pub async fn get_or_create_executions_bucket(
    js: &jetstream::Context,
) -> Result<kv::Store, CronError> {
    // No max_age: execution records are never deleted by this core.
    get_or_create(
        js,
        kv::Config {
            bucket: EXECUTIONS_BUCKET.to_string(),
            history: 1,
            ..Default::default()
        },
    )
    .await
}

/// The lock bucket's `max_age` IS the lease TTL: an entry that is not
/// renewed within `ttl` is purged by the server and the key becomes
/// acquirable again. This is the crash-safety net.
pub async fn get_or_create_locks_bucket(
    js: &jetstream::Context,
    ttl: Duration,
) -> Result<kv::Store, CronError> {
    get_or_create(
        js,
        kv::Config {
            bucket: LOCKS_BUCKET.to_string(),
            history: 1,
            max_age: ttl,
            ..Default::default()
        },
    )
    .await
}

async fn get_or_create(js: &jetstream::Context, config: kv::Config) -> Result<kv::Store, CronError> {
    let name = config.bucket.clone();
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js
            .get_key_value(&name)
            .await
            .map_err(|e| CronError::Kv(e.to_string())),
    }
}

/// Snapshot every current entry under `pattern`, deserializing values as `T`.
///
/// `watch_with_history` delivers the current value of each matching key
/// first (`delta == 0` marks the end of the initial batch), then live
/// updates; we drain the snapshot and drop the watcher. The short deadline
/// covers the empty-bucket case, where no terminal entry arrives.
pub async fn snapshot<T: serde::de::DeserializeOwned>(
    kv: &kv::Store,
    pattern: &str,
) -> Result<Vec<T>, CronError> {
    let mut watcher = kv
        .watch_with_history(pattern)
        .await
        .map_err(|e| CronError::Kv(e.to_string()))?;

    let mut items = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_millis(500));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            entry = watcher.next() => {
                match entry {
                    Some(Ok(e)) => {
                        let is_last = e.delta == 0;
                        if e.operation == kv::Operation::Put {
                            match serde_json::from_slice::<T>(&e.value) {
                                Ok(item) => items.push(item),
                                Err(err) => {
                                    tracing::warn!(key = %e.key, error = %err, "Skipping undeserializable KV entry");
                                }
                            }
                        }
                        if is_last {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(CronError::Kv(e.to_string())),
                    None => break,
                }
            }
            _ = &mut deadline => {
                break; // bucket empty or no more entries
            }
        }
    }

    Ok(items)
}
