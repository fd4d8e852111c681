// Scheduler binary entry point

use anyhow::{Context, Result};
use common::bootstrap::{init_database_pool, init_nats_client, init_redis_pool};
use common::config::Settings;
use common::db::repositories::{PgRunStore, PgScheduleStore, RunStore, ScheduleStore};
use common::lock::{DistributedLock, RedisLock};
use common::queue::{NatsQueueBridge, QueueBridge};
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerService};
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        "scrape-scheduler",
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        check_interval_seconds = settings.scheduler.check_interval_seconds,
        lock_ttl_seconds = settings.scheduler.lock_ttl_seconds,
        "Starting scrape scheduler"
    );

    let db_pool = init_database_pool(&settings).await?;
    let redis_pool = init_redis_pool(&settings).await?;
    let nats_client = init_nats_client(&settings).await?;

    let schedules = Arc::new(PgScheduleStore::new(db_pool.clone())) as Arc<dyn ScheduleStore>;
    let runs = Arc::new(PgRunStore::new(db_pool.clone())) as Arc<dyn RunStore>;
    let lock = Arc::new(RedisLock::new(redis_pool)) as Arc<dyn DistributedLock>;
    let queue = Arc::new(NatsQueueBridge::new(nats_client)) as Arc<dyn QueueBridge>;

    let scheduler = Arc::new(SchedulerService::new(
        SchedulerConfig::from(&settings.scheduler),
        schedules,
        runs,
        lock,
        queue,
    ));

    let scheduler_for_shutdown = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = scheduler_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    let outcome = scheduler.start().await;

    db_pool.close().await;
    telemetry::shutdown_tracer();

    outcome.context("Scheduler loop failed")?;
    info!("Scheduler stopped");
    Ok(())
}
