// Scrape run repository implementation

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{RunStatus, ScrapeRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

/// Scrape run storage
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: &ScrapeRun) -> Result<(), DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapeRun>, DatabaseError>;

    /// Compare-and-set status change. Returns `false` when the run was not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
        message: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// The pending or running run for a source, if any
    async fn find_active(&self, source_name: &str) -> Result<Option<ScrapeRun>, DatabaseError>;

    /// Most recently started run for a source
    async fn find_latest(&self, source_name: &str) -> Result<Option<ScrapeRun>, DatabaseError>;

    /// Fail active runs for a source started before `older_than`; returns how many were failed
    async fn fail_stale(
        &self,
        source_name: &str,
        older_than: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, DatabaseError>;
}

/// Postgres-backed run store
pub struct PgRunStore {
    pool: DbPool,
}

impl PgRunStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<ScrapeRun, DatabaseError> {
    let status: String = row.try_get("status")?;
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        status: status.parse().map_err(DatabaseError::QueryFailed)?,
        message: row.try_get("message")?,
        started_at: row.try_get("started_at")?,
        lock_token: row.try_get("lock_token")?,
    })
}

#[async_trait]
impl RunStore for PgRunStore {
    #[instrument(skip(self, run), fields(run_id = %run.id, source_name = %run.source_name))]
    async fn create(&self, run: &ScrapeRun) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (id, source_name, status, message, started_at, lock_token)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(&run.source_name)
        .bind(run.status.as_str())
        .bind(&run.message)
        .bind(run.started_at)
        .bind(&run.lock_token)
        .execute(self.pool.pool())
        .await?;

        tracing::info!(run_id = %run.id, source_name = %run.source_name, "Scrape run created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapeRun>, DatabaseError> {
        let row = sqlx::query(
            "SELECT id, source_name, status, message, started_at, lock_token FROM scrape_runs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self, message))]
    async fn transition(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
        message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
            SET status = $3,
                message = COALESCE($4, message)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(message)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn find_active(&self, source_name: &str) -> Result<Option<ScrapeRun>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_name, status, message, started_at, lock_token
            FROM scrape_runs
            WHERE source_name = $1 AND status IN ('pending', 'running')
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_name)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_latest(&self, source_name: &str) -> Result<Option<ScrapeRun>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_name, status, message, started_at, lock_token
            FROM scrape_runs
            WHERE source_name = $1
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_name)
        .fetch_optional(self.pool.pool())
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    #[instrument(skip(self, message))]
    async fn fail_stale(
        &self,
        source_name: &str,
        older_than: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
            SET status = 'failed', message = $3
            WHERE source_name = $1
              AND status IN ('pending', 'running')
              AND started_at < $2
            "#,
        )
        .bind(source_name)
        .bind(older_than)
        .bind(message)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
