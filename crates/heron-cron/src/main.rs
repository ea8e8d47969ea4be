use std::env;
use std::time::Duration;

use heron_cron::{CoordinatorConfig, NatsCoordinator};

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

    let defaults = CoordinatorConfig::default();
    let config = CoordinatorConfig {
        tick_interval: env_duration_ms("HERON_TICK_INTERVAL_MS", defaults.tick_interval),
        lock_ttl: env_duration_ms("HERON_LOCK_TTL_MS", defaults.lock_ttl),
        dispatch_timeout: env_duration_ms("HERON_DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout),
    };

    tracing::info!(nats_url = %nats_url, "Connecting to NATS");

    let nats = async_nats::connect(&nats_url).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to connect to NATS");
        std::process::exit(1);
    });

    tracing::info!("Starting schedule coordinator");

    let coordinator = match NatsCoordinator::connect(nats.clone(), config).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bootstrap KV buckets");
            std::process::exit(1);
        }
    };

    if let Err(e) = coordinator.run(nats).await {
        tracing::error!(error = %e, "Coordinator exited with error");
        std::process::exit(1);
    }
}
