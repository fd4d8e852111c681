// In-process store implementations
// Same contracts as the Postgres stores; used by tests and local dry runs.

use crate::db::repositories::{PersistOutcome, RecordStore, RunStore, ScheduleStore};
use crate::errors::DatabaseError;
use crate::models::{NewRecord, ReviewStatus, RunStatus, ScrapeRun, ScrapedRecord, SiteSchedule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InMemoryScheduleStore {
    schedules: Arc<Mutex<BTreeMap<String, SiteSchedule>>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, source_name: &str) -> Option<SiteSchedule> {
        self.schedules.lock().await.get(source_name).cloned()
    }
}

fn by_next_run(a: &SiteSchedule, b: &SiteSchedule) -> std::cmp::Ordering {
    // None sorts first, matching NULLS FIRST
    a.next_run_at
        .cmp(&b.next_run_at)
        .then_with(|| a.source_name.cmp(&b.source_name))
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SiteSchedule>, DatabaseError> {
        let schedules = self.schedules.lock().await;
        let mut due: Vec<SiteSchedule> = schedules.values().filter(|s| s.is_due(now)).cloned().collect();
        due.sort_by(by_next_run);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_enabled(&self) -> Result<Vec<SiteSchedule>, DatabaseError> {
        let schedules = self.schedules.lock().await;
        let mut enabled: Vec<SiteSchedule> = schedules.values().filter(|s| s.enabled).cloned().collect();
        enabled.sort_by(by_next_run);
        Ok(enabled)
    }

    async fn set_next_run_at(&self, source_name: &str, next_run_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let mut schedules = self.schedules.lock().await;
        let schedule = schedules
            .get_mut(source_name)
            .ok_or_else(|| DatabaseError::NotFound(format!("Schedule not found: {}", source_name)))?;
        schedule.next_run_at = Some(next_run_at);
        Ok(())
    }

    async fn upsert(&self, schedule: &SiteSchedule) -> Result<(), DatabaseError> {
        let mut schedules = self.schedules.lock().await;
        match schedules.get_mut(&schedule.source_name) {
            Some(existing) => {
                existing.payload = schedule.payload.clone();
                existing.interval_minutes = schedule.interval_minutes;
                existing.enabled = schedule.enabled;
            }
            None => {
                schedules.insert(schedule.source_name.clone(), schedule.clone());
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<Mutex<Vec<ScrapeRun>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<ScrapeRun> {
        self.runs.lock().await.clone()
    }

    pub async fn for_source(&self, source_name: &str) -> Vec<ScrapeRun> {
        self.runs
            .lock()
            .await
            .iter()
            .filter(|r| r.source_name == source_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &ScrapeRun) -> Result<(), DatabaseError> {
        let mut runs = self.runs.lock().await;
        if runs.iter().any(|r| r.id == run.id) {
            return Err(DatabaseError::DuplicateKey(format!("Run already exists: {}", run.id)));
        }
        if run.status.is_active()
            && runs
                .iter()
                .any(|r| r.source_name == run.source_name && r.status.is_active())
        {
            return Err(DatabaseError::DuplicateKey(format!(
                "Active run already exists for {}",
                run.source_name
            )));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapeRun>, DatabaseError> {
        Ok(self.runs.lock().await.iter().find(|r| r.id == id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
        message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let mut runs = self.runs.lock().await;
        match runs.iter_mut().find(|r| r.id == id && r.status == from) {
            Some(run) => {
                run.status = to;
                if let Some(message) = message {
                    run.message = Some(message.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_active(&self, source_name: &str) -> Result<Option<ScrapeRun>, DatabaseError> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .filter(|r| r.source_name == source_name && r.status.is_active())
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn find_latest(&self, source_name: &str) -> Result<Option<ScrapeRun>, DatabaseError> {
        // max_by_key keeps the last maximum, so ties resolve to the later insert
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .filter(|r| r.source_name == source_name)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn fail_stale(
        &self,
        source_name: &str,
        older_than: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, DatabaseError> {
        let mut runs = self.runs.lock().await;
        let mut failed = 0;
        for run in runs
            .iter_mut()
            .filter(|r| r.source_name == source_name && r.status.is_active() && r.started_at < older_than)
        {
            run.status = RunStatus::Failed;
            run.message = Some(message.to_string());
            failed += 1;
        }
        Ok(failed)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<Mutex<Vec<ScrapedRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<ScrapedRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_unless_duplicate(
        &self,
        record: NewRecord,
        match_fingerprint: bool,
    ) -> Result<PersistOutcome, DatabaseError> {
        // One guard across check and insert; concurrent callers serialize here
        let mut records = self.records.lock().await;

        if records
            .iter()
            .any(|r| r.source_name == record.source_name && r.source_url == record.source_url)
        {
            return Ok(PersistOutcome::Duplicate);
        }

        let fingerprint = record.fingerprint.as_deref().filter(|_| match_fingerprint);
        // Insertion order is ingestion order, so the first hit is the oldest row
        if let Some(matched) = records.iter_mut().find(|r| {
            r.canonical_key == record.canonical_key
                || (fingerprint.is_some() && r.fingerprint.as_deref() == fingerprint)
        }) {
            matched.duplicate_group_id.get_or_insert(matched.id);
            return Ok(PersistOutcome::Blocked {
                matched: matched.clone(),
            });
        }

        let inserted = record.into_record(Uuid::new_v4(), Utc::now());
        records.push(inserted.clone());
        Ok(PersistOutcome::Inserted(inserted))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ScrapedRecord>, DatabaseError> {
        Ok(self.records.lock().await.iter().find(|r| r.id == id).cloned())
    }

    async fn find_pending_review(&self, limit: i64) -> Result<Vec<ScrapedRecord>, DatabaseError> {
        let records = self.records.lock().await;
        let mut pending: Vec<ScrapedRecord> = records
            .iter()
            .filter(|r| r.review_status == ReviewStatus::PendingReview)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        pending.sort_by_key(|r| r.ingested_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn count_pending_review(&self) -> Result<i64, DatabaseError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.review_status == ReviewStatus::PendingReview)
            .count() as i64)
    }

    async fn mark_in_review(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut records = self.records.lock().await;
        match records
            .iter_mut()
            .find(|r| r.id == id && r.review_status == ReviewStatus::PendingReview)
        {
            Some(record) => {
                record.review_status = ReviewStatus::InReview;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_reviewed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut records = self.records.lock().await;
        match records
            .iter_mut()
            .find(|r| r.id == id && r.review_status == ReviewStatus::InReview)
        {
            Some(record) => {
                record.review_status = ReviewStatus::Reviewed;
                record.error_message = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_review_error(&self, id: Uuid, message: &str) -> Result<bool, DatabaseError> {
        let mut records = self.records.lock().await;
        match records
            .iter_mut()
            .find(|r| r.id == id && r.review_status == ReviewStatus::InReview)
        {
            Some(record) => {
                record.retry_count += 1;
                record.error_message = Some(message.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(source: &str, url: &str, key: &str) -> NewRecord {
        NewRecord {
            source_name: source.to_string(),
            source_url: url.to_string(),
            title: "Engineer".to_string(),
            company: "Acme".to_string(),
            canonical_key: key.to_string(),
            fingerprint: None,
            raw_payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_same_source_url_is_duplicate() {
        let store = InMemoryRecordStore::new();
        let first = store.insert_unless_duplicate(new_record("A", "u1", "k1"), true).await.unwrap();
        assert!(matches!(first, PersistOutcome::Inserted(_)));

        let again = store.insert_unless_duplicate(new_record("A", "u1", "k2"), true).await.unwrap();
        assert!(matches!(again, PersistOutcome::Duplicate));
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cross_source_match_backfills_group() {
        let store = InMemoryRecordStore::new();
        store.insert_unless_duplicate(new_record("A", "u1", "k1"), true).await.unwrap();

        let unrelated = store.insert_unless_duplicate(new_record("B", "u2", "k2"), true).await.unwrap();
        assert!(matches!(unrelated, PersistOutcome::Inserted(_)));

        match store.insert_unless_duplicate(new_record("C", "u3", "k1"), true).await.unwrap() {
            PersistOutcome::Blocked { matched } => {
                assert_eq!(matched.source_name, "A");
                assert_eq!(matched.duplicate_group_id, Some(matched.id));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fingerprint_match_can_be_skipped() {
        let store = InMemoryRecordStore::new();
        let mut first = new_record("A", "u1", "k1");
        first.fingerprint = Some("f".to_string());
        store.insert_unless_duplicate(first, true).await.unwrap();

        let mut second = new_record("B", "u2", "k2");
        second.fingerprint = Some("f".to_string());
        let outcome = store.insert_unless_duplicate(second.clone(), false).await.unwrap();
        assert!(matches!(outcome, PersistOutcome::Inserted(_)));

        second.source_url = "u3".to_string();
        second.canonical_key = "k3".to_string();
        let outcome = store.insert_unless_duplicate(second, true).await.unwrap();
        assert!(matches!(outcome, PersistOutcome::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_run_store_rejects_second_active_run() {
        let store = InMemoryRunStore::new();
        store.create(&ScrapeRun::pending("A", "t1")).await.unwrap();
        assert!(store.create(&ScrapeRun::pending("A", "t2")).await.is_err());
        assert!(store.create(&ScrapeRun::pending("B", "t3")).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_transition_is_compare_and_set() {
        let store = InMemoryRunStore::new();
        let run = ScrapeRun::pending("A", "t1");
        store.create(&run).await.unwrap();

        assert!(!store
            .transition(run.id, RunStatus::Running, RunStatus::Succeeded, None)
            .await
            .unwrap());
        assert!(store
            .transition(run.id, RunStatus::Pending, RunStatus::Running, None)
            .await
            .unwrap());
        assert_eq!(
            store.find_by_id(run.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_schedule_store_due_ordering() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let mut later = SiteSchedule::new("B", "{}", 10);
        later.next_run_at = Some(now - chrono::Duration::minutes(1));
        store.upsert(&later).await.unwrap();
        store.upsert(&SiteSchedule::new("A", "{}", 10)).await.unwrap();

        let due = store.find_due(now, 10).await.unwrap();
        let names: Vec<_> = due.iter().map(|s| s.source_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
