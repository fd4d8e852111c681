// Bootstrap helpers shared by the scheduler and poller binaries

use crate::config::Settings;
use crate::db::{DbPool, RedisPool};
use crate::queue::{NatsClient, NatsStreamConfig};
use anyhow::{Context, Result};
use tracing::info;

/// Connect to Postgres, apply migrations and check the connection.
///
/// # Errors
/// Returns error if the pool cannot connect, a migration fails or the health check fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    db_pool
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    db_pool
        .health_check()
        .await
        .context("Database health check failed")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Initialize Redis pool for distributed locking
/// Used by: Scheduler
///
/// # Errors
/// Returns error if Redis is unreachable
#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<RedisPool> {
    info!("Initializing Redis pool");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;

    redis_pool
        .health_check()
        .await
        .context("Redis health check failed")?;

    info!("Redis pool initialized");
    Ok(redis_pool)
}

/// Connect to NATS and make sure the work stream exists
///
/// # Errors
/// Returns error if the connection or stream creation fails
#[tracing::instrument(skip(settings))]
pub async fn init_nats_client(settings: &Settings) -> Result<NatsClient> {
    info!("Initializing NATS client");

    let nats_client = NatsClient::new(NatsStreamConfig::from(&settings.nats))
        .await
        .context("Failed to initialize NATS client")?;

    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize JetStream stream")?;

    info!(stream_name = %settings.nats.stream_name, "NATS client initialized");
    Ok(nats_client)
}
