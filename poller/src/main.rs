// Review poller binary entry point

use anyhow::{Context, Result};
use common::bootstrap::{init_database_pool, init_nats_client};
use common::config::Settings;
use common::db::repositories::{PgRecordStore, RecordStore};
use common::poller::{PollerConfig, PollerService};
use common::queue::{NatsQueueBridge, QueueBridge};
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
        "review-poller",
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        interval_seconds = settings.poller.interval_seconds,
        batch_size = settings.poller.batch_size,
        "Starting review poller"
    );

    let db_pool = init_database_pool(&settings).await?;
    let nats_client = init_nats_client(&settings).await?;

    let records = Arc::new(PgRecordStore::new(db_pool.clone())) as Arc<dyn RecordStore>;
    let queue = Arc::new(NatsQueueBridge::new(nats_client)) as Arc<dyn QueueBridge>;

    let poller = Arc::new(PollerService::new(
        PollerConfig::from(&settings.poller),
        records,
        queue,
    ));

    let poller_for_shutdown = poller.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        poller_for_shutdown.stop();
    });

    let outcome = poller.start_polling_loop().await;

    db_pool.close().await;
    telemetry::shutdown_tracer();

    outcome.context("Review poller loop failed")?;
    info!("Review poller stopped");
    Ok(())
}
