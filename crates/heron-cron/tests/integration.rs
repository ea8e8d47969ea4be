//! Integration tests — require a running NATS server.
//!
//! Run with:
//!   NATS_TEST_URL=nats://localhost:4222 cargo test -p heron-cron --test integration -- --include-ignored --test-threads=1
//!
//! `--test-threads=1` is required: the tests share the KV buckets, and the
//! lease-expiry test recreates the `cron_locks` bucket with a short TTL.
//!
//! These tests are marked `#[ignore]` so they don't run in CI without NATS.

use std::time::Duration;

use async_nats::jetstream;
use futures::StreamExt;
use heron_cron::{
    kv, CompletionReport, CoordinatorConfig, CronClient, DispatchReply, DispatchRequest,
    ExecutionFilter, ExecutionStatus, NatsCoordinator, NewSchedule, TriggerSource,
};

fn test_url() -> String {
    std::env::var("NATS_TEST_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

async fn connect() -> async_nats::Client {
    async_nats::connect(test_url())
        .await
        .expect("Failed to connect to NATS — is NATS_TEST_URL set and NATS running?")
}

fn unique_id(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    format!("{prefix}-{ts}")
}

fn definition(id: &str, target: &str) -> NewSchedule {
    NewSchedule {
        id: id.to_string(),
        name: format!("test schedule {id}"),
        description: None,
        target: target.to_string(),
        expr: "0 9 * * *".to_string(),
        timezone: "UTC".to_string(),
        payload: Some(serde_json::json!({ "marker": id })),
        enabled: true,
    }
}

/// Make a schedule immediately due by backdating `next_run_at`.
async fn backdate(client: &CronClient, id: &str) {
    use heron_cron::ScheduleStore;
    let js = jetstream::new(connect().await);
    let kv_store = kv::get_or_create_schedules_bucket(&js).await.unwrap();
    let store = heron_cron::nats_impls::KvScheduleStore::new(kv_store);
    let mut schedule = client.get_schedule(id).await.unwrap().expect("exists");
    schedule.next_run_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
    store.put(&schedule).await.unwrap();
}

/// Answer dispatch requests for `target`, accepting each and recording it.
/// Returns a handle to the count of requests served.
async fn fake_agent(
    nats: &async_nats::Client,
    target: &str,
) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut sub = nats
        .subscribe(kv::dispatch_subject(target))
        .await
        .expect("subscribe agent subject");
    let nats = nats.clone();
    let served = std::sync::Arc::clone(&count);
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let _request: DispatchRequest = serde_json::from_slice(&msg.payload).unwrap();
            served.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(reply) = msg.reply {
                let ack = serde_json::to_vec(&DispatchReply {
                    accepted: true,
                    reason: None,
                })
                .unwrap();
                let _ = nats.publish(reply, ack.into()).await;
            }
        }
    });
    count
}

// ── CronClient CRUD ──────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_create_get_list_remove() {
    let client = CronClient::new(connect().await).await.unwrap();
    let id = unique_id("crud");

    let created = client
        .create_schedule(definition(&id, "crud-agent"))
        .await
        .unwrap();
    assert!(created.next_run_at.unwrap() > chrono::Utc::now());

    let fetched = client.get_schedule(&id).await.unwrap().expect("exists");
    assert_eq!(fetched.target, "crud-agent");

    let all = client.list_schedules().await.unwrap();
    assert!(all.iter().any(|s| s.id == id));

    // Duplicate create is rejected.
    assert!(client.create_schedule(definition(&id, "crud-agent")).await.is_err());

    client.remove_schedule(&id).await.unwrap();
    assert!(client.get_schedule(&id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_invalid_definitions_are_never_stored() {
    let client = CronClient::new(connect().await).await.unwrap();
    let id = unique_id("invalid");

    let mut bad = definition(&id, "agent");
    bad.expr = "99 * * * *".to_string();
    assert!(client.create_schedule(bad).await.is_err());

    let mut bad = definition(&id, "agent");
    bad.timezone = "Nowhere/Z".to_string();
    assert!(client.create_schedule(bad).await.is_err());

    assert!(client.get_schedule(&id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_disable_clears_and_enable_recomputes_next_run() {
    let client = CronClient::new(connect().await).await.unwrap();
    let id = unique_id("toggle");
    client.create_schedule(definition(&id, "agent")).await.unwrap();

    let disabled = client.set_enabled(&id, false).await.unwrap();
    assert!(disabled.next_run_at.is_none());

    let enabled = client.set_enabled(&id, true).await.unwrap();
    assert!(enabled.next_run_at.unwrap() > chrono::Utc::now());

    client.remove_schedule(&id).await.unwrap();
}

// ── Coordinator scenarios ────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_two_coordinators_dispatch_exactly_once() {
    let nats = connect().await;
    let client = CronClient::new(nats.clone()).await.unwrap();
    let id = unique_id("once");
    let target = unique_id("agent-once");

    client.create_schedule(definition(&id, &target)).await.unwrap();
    backdate(&client, &id).await;
    let served = fake_agent(&nats, &target).await;

    let a = NatsCoordinator::connect(nats.clone(), CoordinatorConfig::default())
        .await
        .unwrap();
    let b = NatsCoordinator::connect(nats.clone(), CoordinatorConfig::default())
        .await
        .unwrap();

    tokio::join!(
        a.fire(&id, TriggerSource::Schedule),
        b.fire(&id, TriggerSource::Schedule),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        served.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "exactly one coordinator must win the lease"
    );

    // The winner advanced the bookkeeping.
    let schedule = client.get_schedule(&id).await.unwrap().unwrap();
    assert!(schedule.next_run_at.unwrap() > chrono::Utc::now());
    assert!(schedule.last_run_at.is_some());

    client.remove_schedule(&id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_completion_finalizes_execution() {
    let nats = connect().await;
    let client = CronClient::new(nats.clone()).await.unwrap();
    let id = unique_id("complete");
    let target = unique_id("agent-complete");

    client.create_schedule(definition(&id, &target)).await.unwrap();
    backdate(&client, &id).await;
    fake_agent(&nats, &target).await;

    let coordinator = NatsCoordinator::connect(nats.clone(), CoordinatorConfig::default())
        .await
        .unwrap();
    coordinator.fire(&id, TriggerSource::Schedule).await;

    let running = client
        .executions(&ExecutionFilter {
            schedule_id: Some(id.clone()),
            ..ExecutionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].status, ExecutionStatus::Running);

    coordinator
        .handle_completion(CompletionReport {
            execution_id: running[0].id.clone(),
            success: true,
            error: None,
        })
        .await;

    let done = client
        .executions(&ExecutionFilter {
            schedule_id: Some(id.clone()),
            status: Some(ExecutionStatus::Success),
            ..ExecutionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
    assert!(done[0].finished_at.is_some());

    client.remove_schedule(&id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_manual_trigger_of_disabled_schedule() {
    let nats = connect().await;
    let client = CronClient::new(nats.clone()).await.unwrap();
    let id = unique_id("manual");
    let target = unique_id("agent-manual");

    client.create_schedule(definition(&id, &target)).await.unwrap();
    client.set_enabled(&id, false).await.unwrap();
    let served = fake_agent(&nats, &target).await;

    let coordinator = NatsCoordinator::connect(nats.clone(), CoordinatorConfig::default())
        .await
        .unwrap();
    coordinator.trigger_now(&id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 1);
    let schedule = client.get_schedule(&id).await.unwrap().unwrap();
    assert!(schedule.next_run_at.is_none(), "manual run must not touch next_run_at");

    client.remove_schedule(&id).await.unwrap();
}

// ── Lease service ────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_lease_mutual_exclusion_and_release() {
    use heron_cron::nats_impls::KvScheduleLock;
    use heron_cron::ScheduleLock;

    let js = jetstream::new(connect().await);
    let store = kv::get_or_create_locks_bucket(&js, Duration::from_secs(30))
        .await
        .unwrap();
    let lock = KvScheduleLock::new(store);
    let key = unique_id("lease");

    let (first, second) = tokio::join!(
        lock.try_acquire(&key, "node-a"),
        lock.try_acquire(&key, "node-b"),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(
        first.is_some() != second.is_some(),
        "exactly one concurrent acquirer must win"
    );

    let lease = first.or(second).unwrap();
    let renewed = lock.renew(&lease, "winner").await.unwrap();
    assert!(renewed.revision > lease.revision);

    lock.release(&renewed).await.unwrap();
    let reacquired = lock.try_acquire(&key, "node-c").await.unwrap();
    assert!(reacquired.is_some(), "released key must be acquirable");
    lock.release(&reacquired.unwrap()).await.unwrap();
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL, recreates the cron_locks bucket"]
async fn test_expired_lease_is_reclaimable() {
    use heron_cron::nats_impls::KvScheduleLock;
    use heron_cron::ScheduleLock;

    let js = jetstream::new(connect().await);
    // Fresh bucket with a short TTL so expiry is observable.
    let _ = js.delete_key_value(kv::LOCKS_BUCKET).await;
    let store = kv::get_or_create_locks_bucket(&js, Duration::from_secs(2))
        .await
        .unwrap();
    let lock = KvScheduleLock::new(store);
    let key = unique_id("expiry");

    let lease = lock.try_acquire(&key, "node-x").await.unwrap().unwrap();
    assert!(lock.try_acquire(&key, "node-y").await.unwrap().is_none());

    // Crash: node-x never renews. After the TTL the key is fair game.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let taken_over = lock.try_acquire(&key, "node-y").await.unwrap();
    assert!(taken_over.is_some(), "expired lease must be reclaimable");

    // The dead node's stale lease can no longer be renewed.
    assert!(lock.renew(&lease, "node-x").await.is_err());
}
