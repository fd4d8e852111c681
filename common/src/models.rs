use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Schedule Models
// ============================================================================

/// Recurring fetch configuration for one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSchedule {
    pub source_name: String,
    /// Raw JSON handed to the fetch worker once parsed
    pub payload: String,
    pub interval_minutes: i32,
    /// `None` means the schedule has never fired and is due immediately
    pub next_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl SiteSchedule {
    pub fn new(source_name: impl Into<String>, payload: impl Into<String>, interval_minutes: i32) -> Self {
        Self {
            source_name: source_name.into(),
            payload: payload.into(),
            interval_minutes,
            next_run_at: None,
            enabled: true,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map_or(true, |at| at <= now)
    }

    /// Lock key guarding this source
    pub fn lock_key(&self) -> String {
        lock_key(&self.source_name)
    }
}

pub fn lock_key(source_name: &str) -> String {
    format!("lock:{}", source_name)
}

// ============================================================================
// Run Models
// ============================================================================

/// Scrape run lifecycle: pending -> running -> {succeeded, failed}, pending -> failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("Unknown run status: {}", other)),
        }
    }
}

/// One firing of a schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub source_name: String,
    pub status: RunStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub lock_token: Option<String>,
}

impl ScrapeRun {
    pub fn pending(source_name: impl Into<String>, lock_token: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.into(),
            status: RunStatus::Pending,
            message: None,
            started_at: Utc::now(),
            lock_token: Some(lock_token.into()),
        }
    }
}

// ============================================================================
// Scraped Record Models
// ============================================================================

/// A posting as handed over by the fetch worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedJob {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default, alias = "url")]
    pub source_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub salary_min: Option<i64>,
    #[serde(default)]
    pub salary_max: Option<i64>,
}

impl ScrapedJob {
    pub fn new(title: impl Into<String>, company: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            source_url: source_url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    PendingReview,
    InReview,
    Reviewed,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::PendingReview => "pending_review",
            ReviewStatus::InReview => "in_review",
            ReviewStatus::Reviewed => "reviewed",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(ReviewStatus::PendingReview),
            "in_review" => Ok(ReviewStatus::InReview),
            "reviewed" => Ok(ReviewStatus::Reviewed),
            other => Err(format!("Unknown review status: {}", other)),
        }
    }
}

/// Persisted posting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub id: Uuid,
    pub source_name: String,
    pub source_url: String,
    pub title: String,
    pub company: String,
    pub canonical_key: String,
    pub fingerprint: Option<String>,
    pub duplicate_group_id: Option<Uuid>,
    pub raw_payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
    pub review_status: ReviewStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

/// Row about to be inserted
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub source_name: String,
    pub source_url: String,
    pub title: String,
    pub company: String,
    pub canonical_key: String,
    pub fingerprint: Option<String>,
    pub raw_payload: serde_json::Value,
}

impl NewRecord {
    pub fn into_record(self, id: Uuid, ingested_at: DateTime<Utc>) -> ScrapedRecord {
        ScrapedRecord {
            id,
            source_name: self.source_name,
            source_url: self.source_url,
            title: self.title,
            company: self.company,
            canonical_key: self.canonical_key,
            fingerprint: self.fingerprint,
            duplicate_group_id: None,
            raw_payload: self.raw_payload,
            ingested_at,
            review_status: ReviewStatus::PendingReview,
            retry_count: 0,
            error_message: None,
        }
    }
}

// ============================================================================
// Batch Result Models
// ============================================================================

/// Exactly one of these per submitted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Classification {
    Inserted { record_id: Uuid },
    Duplicate,
    Blocked { matched_record_id: Uuid },
    Error { message: String },
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Inserted { .. } => "inserted",
            Classification::Duplicate => "duplicate",
            Classification::Blocked { .. } => "blocked",
            Classification::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub index: usize,
    pub title: String,
    pub source_url: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub inserted: usize,
    pub skipped_duplicates: usize,
    pub blocked_duplicates: usize,
    pub errors: Vec<RecordError>,
    /// Per-record classification in submission order
    pub classifications: Vec<Classification>,
}

impl BatchResult {
    pub fn record(&mut self, index: usize, job: &ScrapedJob, classification: Classification) {
        match &classification {
            Classification::Inserted { .. } => self.inserted += 1,
            Classification::Duplicate => self.skipped_duplicates += 1,
            Classification::Blocked { .. } => self.blocked_duplicates += 1,
            Classification::Error { message } => self.errors.push(RecordError {
                index,
                title: job.title.clone(),
                source_url: job.source_url.clone(),
                message: message.clone(),
            }),
        }
        self.classifications.push(classification);
    }

    pub fn classified(&self) -> usize {
        self.inserted + self.skipped_duplicates + self.blocked_duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Succeeded));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Succeeded));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [RunStatus::Pending, RunStatus::Running, RunStatus::Succeeded, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_schedule_due_rules() {
        let now = Utc::now();
        let mut schedule = SiteSchedule::new("ExampleSite", "{}", 30);
        assert!(schedule.is_due(now));

        schedule.next_run_at = Some(now + Duration::minutes(5));
        assert!(!schedule.is_due(now));

        schedule.next_run_at = Some(now);
        assert!(schedule.is_due(now));

        schedule.enabled = false;
        assert!(!schedule.is_due(now));
        assert_eq!(schedule.lock_key(), "lock:ExampleSite");
    }

    #[test]
    fn test_scraped_job_accepts_url_alias() {
        let job: ScrapedJob =
            serde_json::from_value(serde_json::json!({"title": "Engineer", "url": "u1"})).unwrap();
        assert_eq!(job.source_url, "u1");
        assert_eq!(job.company, "");
    }

    #[test]
    fn test_batch_result_counts() {
        let job = ScrapedJob::new("Engineer", "Acme", "u1");
        let mut result = BatchResult::default();
        result.record(0, &job, Classification::Inserted { record_id: Uuid::new_v4() });
        result.record(1, &job, Classification::Duplicate);
        result.record(2, &job, Classification::Error { message: "boom".to_string() });

        assert_eq!(result.classified(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, 2);
        assert_eq!(result.classifications.len(), 3);
    }
}
