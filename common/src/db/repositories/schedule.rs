// Schedule repository implementation

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::SiteSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

/// Schedule storage used by the scheduler
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Enabled schedules whose `next_run_at` is unset or not after `now`, oldest first
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SiteSchedule>, DatabaseError>;

    /// All enabled schedules, for status reporting
    async fn list_enabled(&self) -> Result<Vec<SiteSchedule>, DatabaseError>;

    /// Move the schedule's next firing time
    async fn set_next_run_at(&self, source_name: &str, next_run_at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Create or replace a schedule definition
    async fn upsert(&self, schedule: &SiteSchedule) -> Result<(), DatabaseError>;
}

/// Postgres-backed schedule store
pub struct PgScheduleStore {
    pool: DbPool,
}

impl PgScheduleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn schedule_from_row(row: &PgRow) -> Result<SiteSchedule, DatabaseError> {
    Ok(SiteSchedule {
        source_name: row.try_get("source_name")?,
        payload: row.try_get("payload")?,
        interval_minutes: row.try_get("interval_minutes")?,
        next_run_at: row.try_get("next_run_at")?,
        enabled: row.try_get("enabled")?,
    })
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    #[instrument(skip(self))]
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SiteSchedule>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT source_name, payload, interval_minutes, next_run_at, enabled
            FROM site_schedules
            WHERE enabled = true
              AND (next_run_at IS NULL OR next_run_at <= $1)
            ORDER BY next_run_at ASC NULLS FIRST, source_name ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.pool.pool())
        .await?;

        let schedules = rows.iter().map(schedule_from_row).collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(count = schedules.len(), "Found due schedules");
        Ok(schedules)
    }

    #[instrument(skip(self))]
    async fn list_enabled(&self) -> Result<Vec<SiteSchedule>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT source_name, payload, interval_minutes, next_run_at, enabled
            FROM site_schedules
            WHERE enabled = true
            ORDER BY next_run_at ASC NULLS FIRST, source_name ASC
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_next_run_at(&self, source_name: &str, next_run_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE site_schedules SET next_run_at = $2 WHERE source_name = $1")
            .bind(source_name)
            .bind(next_run_at)
            .execute(self.pool.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "Schedule not found: {}",
                source_name
            )));
        }

        tracing::debug!(source_name, next_run_at = %next_run_at, "Schedule advanced");
        Ok(())
    }

    #[instrument(skip(self, schedule), fields(source_name = %schedule.source_name))]
    async fn upsert(&self, schedule: &SiteSchedule) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO site_schedules (source_name, payload, interval_minutes, next_run_at, enabled)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_name) DO UPDATE
            SET payload = EXCLUDED.payload,
                interval_minutes = EXCLUDED.interval_minutes,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(&schedule.source_name)
        .bind(&schedule.payload)
        .bind(schedule.interval_minutes)
        .bind(schedule.next_run_at)
        .bind(schedule.enabled)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(source_name = %schedule.source_name, "Schedule saved");
        Ok(())
    }
}
