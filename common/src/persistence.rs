// Batch ingestion of scraped postings with three-tier duplicate detection

use crate::config::{DedupConfig, FingerprintMatching};
use crate::db::repositories::{PersistOutcome, RecordStore};
use crate::dedup;
use crate::errors::{DatabaseError, ValidationError};
use crate::models::{BatchResult, Classification, NewRecord, ScrapedJob};
use crate::telemetry;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub struct JobPersistenceEngine {
    records: Arc<dyn RecordStore>,
    fingerprint_matching: FingerprintMatching,
}

impl JobPersistenceEngine {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            fingerprint_matching: FingerprintMatching::default(),
        }
    }

    pub fn from_config(records: Arc<dyn RecordStore>, config: &DedupConfig) -> Self {
        Self::new(records).with_fingerprint_matching(config.fingerprint_matching)
    }

    pub fn with_fingerprint_matching(mut self, mode: FingerprintMatching) -> Self {
        self.fingerprint_matching = mode;
        self
    }

    /// Ingest a batch fetched from `source_name`.
    ///
    /// A batch comes from a single source: `source_name` applies to every
    /// record in `jobs`.
    ///
    /// Records are handled one at a time and each one's writes commit on their
    /// own: a failure on record N is reported in `errors` and never rolls back
    /// records 0..N. The batch as a whole is therefore not atomic. Sequential
    /// handling also lets later records in the batch see rows inserted by
    /// earlier ones, so an in-batch repeat classifies as a duplicate. The
    /// check and insert for one record are atomic in the store, so concurrent
    /// batches from different sources cannot both insert the same posting.
    #[instrument(skip(self, jobs), fields(source_name = %source_name, batch_size = jobs.len()))]
    pub async fn persist_jobs(&self, jobs: &[ScrapedJob], source_name: &str) -> BatchResult {
        let mut result = BatchResult::default();

        for (index, job) in jobs.iter().enumerate() {
            let classification = match self.persist_one(job, source_name).await {
                Ok(classification) => classification,
                Err(message) => {
                    warn!(
                        index,
                        title = %job.title,
                        source_url = %job.source_url,
                        error = %message,
                        "Record not persisted"
                    );
                    Classification::Error { message }
                }
            };

            telemetry::record_ingest_outcome(source_name, classification.label());
            result.record(index, job, classification);
        }

        info!(
            inserted = result.inserted,
            skipped_duplicates = result.skipped_duplicates,
            blocked_duplicates = result.blocked_duplicates,
            errors = result.errors.len(),
            "Batch persisted"
        );

        result
    }

    async fn persist_one(&self, job: &ScrapedJob, source_name: &str) -> Result<Classification, String> {
        validate(job).map_err(|e| e.to_string())?;

        let (canonical_key, fingerprint) = dedup::canonicalize(job);

        let record = NewRecord {
            source_name: source_name.to_string(),
            source_url: job.source_url.clone(),
            title: job.title.clone(),
            company: job.company.clone(),
            canonical_key,
            fingerprint,
            raw_payload: serde_json::to_value(job).map_err(|e| e.to_string())?,
        };
        let match_fingerprint = self.fingerprint_matching == FingerprintMatching::Exact;

        match self.records.insert_unless_duplicate(record, match_fingerprint).await {
            Ok(PersistOutcome::Inserted(inserted)) => Ok(Classification::Inserted {
                record_id: inserted.id,
            }),
            Ok(PersistOutcome::Duplicate) => {
                debug!(source_url = %job.source_url, "Same-source duplicate");
                Ok(Classification::Duplicate)
            }
            Ok(PersistOutcome::Blocked { matched }) => {
                debug!(
                    source_url = %job.source_url,
                    matched_record_id = %matched.id,
                    matched_source = %matched.source_name,
                    "Cross-source duplicate blocked"
                );
                Ok(Classification::Blocked {
                    matched_record_id: matched.id,
                })
            }
            Err(DatabaseError::DuplicateKey(detail)) => {
                error!(
                    source_url = %job.source_url,
                    detail = %detail,
                    "Unique constraint rejected a record that passed the duplicate check"
                );
                Err(format!("unique constraint violation: {}", detail))
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

fn validate(job: &ScrapedJob) -> Result<(), ValidationError> {
    if job.title.trim().is_empty() {
        return Err(ValidationError::MissingField("title"));
    }
    if job.source_url.trim().is_empty() {
        return Err(ValidationError::MissingField("source_url"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryRecordStore;

    fn engine() -> (JobPersistenceEngine, InMemoryRecordStore) {
        let store = InMemoryRecordStore::new();
        (JobPersistenceEngine::new(Arc::new(store.clone())), store)
    }

    #[test]
    fn test_validate_requires_title_and_url() {
        assert!(validate(&ScrapedJob::new("Engineer", "Acme", "u1")).is_ok());
        assert_eq!(
            validate(&ScrapedJob::new("  ", "Acme", "u1")),
            Err(ValidationError::MissingField("title"))
        );
        assert_eq!(
            validate(&ScrapedJob::new("Engineer", "Acme", "")),
            Err(ValidationError::MissingField("source_url"))
        );
    }

    #[tokio::test]
    async fn test_identical_record_twice_in_one_batch() {
        let (engine, store) = engine();
        let job = ScrapedJob::new("Engineer", "Acme", "u1");

        let result = engine.persist_jobs(&[job.clone(), job], "A").await;

        assert_eq!(result.inserted, 1);
        assert_eq!(result.skipped_duplicates, 1);
        assert!(result.errors.is_empty());
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_field_reports_error_and_continues() {
        let (engine, _store) = engine();
        let jobs = vec![
            ScrapedJob::new("", "Acme", "u1"),
            ScrapedJob::new("Engineer", "Acme", "u2"),
        ];

        let result = engine.persist_jobs(&jobs, "A").await;

        assert_eq!(result.inserted, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, 0);
        assert_eq!(result.errors[0].source_url, "u1");
        assert!(result.errors[0].message.contains("missing required field"));
    }

    #[tokio::test]
    async fn test_fingerprint_matching_can_be_disabled() {
        let store = InMemoryRecordStore::new();
        let engine = JobPersistenceEngine::new(Arc::new(store.clone()))
            .with_fingerprint_matching(FingerprintMatching::Disabled);

        let mut first = ScrapedJob::new("Backend Engineer", "Acme", "u1");
        first.description = "Write Rust services".to_string();
        let mut second = ScrapedJob::new("Platform Engineer", "Acme Inc", "u2");
        second.description = "Write Rust services".to_string();

        let result = engine.persist_jobs(&[first, second], "A").await;
        assert_eq!(result.inserted, 2);
        assert_eq!(result.blocked_duplicates, 0);
    }

    #[tokio::test]
    async fn test_from_config_applies_loaded_fingerprint_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[dedup]\nfingerprint_matching = \"disabled\"\n",
        )
        .unwrap();
        let settings = crate::config::Settings::load_from_path(dir.path()).unwrap();

        let store = InMemoryRecordStore::new();
        let engine = JobPersistenceEngine::from_config(Arc::new(store.clone()), &settings.dedup);

        let mut first = ScrapedJob::new("Backend Engineer", "Acme", "u1");
        first.description = "Write Rust services".to_string();
        let mut second = ScrapedJob::new("Platform Engineer", "Acme Inc", "u2");
        second.description = "Write Rust services".to_string();

        engine.persist_jobs(&[first], "A").await;
        let result = engine.persist_jobs(&[second], "B").await;
        assert_eq!(result.inserted, 1);
        assert_eq!(store.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_from_default_config_matches_fingerprints() {
        let store = InMemoryRecordStore::new();
        let engine = JobPersistenceEngine::from_config(Arc::new(store.clone()), &DedupConfig::default());

        let mut first = ScrapedJob::new("Backend Engineer", "Acme", "u1");
        first.description = "Write Rust services".to_string();
        let mut second = ScrapedJob::new("Platform Engineer", "Acme Inc", "u2");
        second.description = "Write Rust services".to_string();

        engine.persist_jobs(&[first], "A").await;
        let result = engine.persist_jobs(&[second], "B").await;
        assert_eq!(result.blocked_duplicates, 1);
    }
}
