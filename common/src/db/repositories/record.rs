// Scraped record repository implementation

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{NewRecord, ScrapedRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

/// Result of an atomic classify-and-insert
#[derive(Debug, Clone)]
pub enum PersistOutcome {
    Inserted(ScrapedRecord),
    /// `(source_name, source_url)` already stored
    Duplicate,
    /// Oldest row of another posting sharing the canonical key or fingerprint
    Blocked { matched: ScrapedRecord },
}

/// Scraped record storage used by ingestion and the review poller
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Same-source check, cross-source check and insert as one unit.
    ///
    /// Concurrent calls for the same URL, canonical key or fingerprint are
    /// serialized, so two writers can never both insert the same posting.
    /// A blocked match gets its `duplicate_group_id` backfilled with its own id
    /// when unset. `match_fingerprint = false` restricts cross-source matching
    /// to the canonical key.
    async fn insert_unless_duplicate(
        &self,
        record: NewRecord,
        match_fingerprint: bool,
    ) -> Result<PersistOutcome, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapedRecord>, DatabaseError>;

    /// Rows awaiting review, oldest ingestion first
    async fn find_pending_review(&self, limit: i64) -> Result<Vec<ScrapedRecord>, DatabaseError>;

    async fn count_pending_review(&self) -> Result<i64, DatabaseError>;

    /// pending_review -> in_review; `false` when the row was not pending
    async fn mark_in_review(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// in_review -> reviewed; `false` when the row was not in review
    async fn mark_reviewed(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Record a failed review attempt on an in_review row
    async fn record_review_error(&self, id: Uuid, message: &str) -> Result<bool, DatabaseError>;
}

/// Postgres-backed record store
pub struct PgRecordStore {
    pool: DbPool,
}

impl PgRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const RECORD_COLUMNS: &str = "id, source_name, source_url, title, company, canonical_key, \
     fingerprint, duplicate_group_id, raw_payload, ingested_at, review_status, retry_count, error_message";

fn record_from_row(row: &PgRow) -> Result<ScrapedRecord, DatabaseError> {
    let review_status: String = row.try_get("review_status")?;
    Ok(ScrapedRecord {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        source_url: row.try_get("source_url")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        canonical_key: row.try_get("canonical_key")?,
        fingerprint: row.try_get("fingerprint")?,
        duplicate_group_id: row.try_get("duplicate_group_id")?,
        raw_payload: row.try_get("raw_payload")?,
        ingested_at: row.try_get("ingested_at")?,
        review_status: review_status.parse().map_err(DatabaseError::QueryFailed)?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
    })
}

// First key of the two-key advisory lock space, one per lock class
const URL_LOCK_CLASS: i32 = 1;
const CANONICAL_KEY_LOCK_CLASS: i32 = 2;
const FINGERPRINT_LOCK_CLASS: i32 = 3;

/// Transaction-scoped advisory lock, released on commit or rollback
async fn lock_for_xact(
    tx: &mut Transaction<'_, Postgres>,
    class: i32,
    key: &str,
) -> Result<(), DatabaseError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
        .bind(class)
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(source_name = %record.source_name, source_url = %record.source_url))]
    async fn insert_unless_duplicate(
        &self,
        record: NewRecord,
        match_fingerprint: bool,
    ) -> Result<PersistOutcome, DatabaseError> {
        let fingerprint = record.fingerprint.as_deref().filter(|_| match_fingerprint);

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        // Fixed order (url, key, fingerprint) keeps concurrent writers deadlock-free
        let source_key = format!("{}|{}", record.source_name, record.source_url);
        lock_for_xact(&mut tx, URL_LOCK_CLASS, &source_key).await?;
        lock_for_xact(&mut tx, CANONICAL_KEY_LOCK_CLASS, &record.canonical_key).await?;
        if let Some(fingerprint) = fingerprint {
            lock_for_xact(&mut tx, FINGERPRINT_LOCK_CLASS, fingerprint).await?;
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM scraped_jobs WHERE source_name = $1 AND source_url = $2)",
        )
        .bind(&record.source_name)
        .bind(&record.source_url)
        .fetch_one(&mut *tx)
        .await?;

        if exists {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
            return Ok(PersistOutcome::Duplicate);
        }

        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM scraped_jobs
            WHERE canonical_key = $1
               OR ($2::text IS NOT NULL AND fingerprint = $2)
            ORDER BY ingested_at ASC
            LIMIT 1
            "#
        );
        let matched = sqlx::query(&sql)
            .bind(&record.canonical_key)
            .bind(fingerprint)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = matched {
            let matched = record_from_row(&row)?;
            let sql = format!(
                r#"
                UPDATE scraped_jobs
                SET duplicate_group_id = COALESCE(duplicate_group_id, id)
                WHERE id = $1
                RETURNING {RECORD_COLUMNS}
                "#
            );
            let row = sqlx::query(&sql).bind(matched.id).fetch_one(&mut *tx).await?;
            let matched = record_from_row(&row)?;

            tx.commit()
                .await
                .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;
            return Ok(PersistOutcome::Blocked { matched });
        }

        let id = Uuid::new_v4();
        let ingested_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO scraped_jobs (
                id, source_name, source_url, title, company,
                canonical_key, fingerprint, raw_payload, ingested_at, review_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending_review')
            "#,
        )
        .bind(id)
        .bind(&record.source_name)
        .bind(&record.source_url)
        .bind(&record.title)
        .bind(&record.company)
        .bind(&record.canonical_key)
        .bind(&record.fingerprint)
        .bind(&record.raw_payload)
        .bind(ingested_at)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        tracing::debug!(record_id = %id, "Scraped record inserted");
        Ok(PersistOutcome::Inserted(record.into_record(id, ingested_at)))
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapedRecord>, DatabaseError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM scraped_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_pending_review(&self, limit: i64) -> Result<Vec<ScrapedRecord>, DatabaseError> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM scraped_jobs
            WHERE review_status = 'pending_review'
            ORDER BY ingested_at ASC
            LIMIT $1
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_pending_review(&self) -> Result<i64, DatabaseError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scraped_jobs WHERE review_status = 'pending_review'")
                .fetch_one(self.pool.pool())
                .await?;

        Ok(count)
    }

    #[instrument(skip(self))]
    async fn mark_in_review(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE scraped_jobs SET review_status = 'in_review' WHERE id = $1 AND review_status = 'pending_review'",
        )
        .bind(id)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn mark_reviewed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE scraped_jobs
            SET review_status = 'reviewed', error_message = NULL
            WHERE id = $1 AND review_status = 'in_review'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, message))]
    async fn record_review_error(&self, id: Uuid, message: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE scraped_jobs
            SET retry_count = retry_count + 1, error_message = $2
            WHERE id = $1 AND review_status = 'in_review'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
