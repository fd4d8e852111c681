// Scheduler engine: turns due site schedules into fetch tasks under a per-source lock

use crate::db::repositories::{RunStore, ScheduleStore};
use crate::errors::{DatabaseError, RunTransitionError, SchedulerError, ValidationError};
use crate::lock::{new_lock_token, DistributedLock, ReleaseOutcome};
use crate::models::{lock_key, RunStatus, ScrapeRun, SiteSchedule};
use crate::queue::{QueueBridge, QueueTask, TaskId};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the daemon loop runs a pass (in seconds)
    pub check_interval_seconds: u64,
    /// TTL for per-source locks (in seconds)
    pub lock_ttl_seconds: u64,
    /// Maximum number of schedules handled per pass
    pub max_schedules_per_pass: usize,
    /// Active runs older than this are failed as abandoned
    pub stale_run_minutes: i64,
    /// Sleep after a failed pass (in seconds)
    pub error_backoff_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 60,
            lock_ttl_seconds: 300,
            max_schedules_per_pass: 500,
            stale_run_minutes: 180,
            error_backoff_seconds: 120,
        }
    }
}

impl From<&crate::config::SchedulerConfig> for SchedulerConfig {
    fn from(config: &crate::config::SchedulerConfig) -> Self {
        Self {
            check_interval_seconds: config.check_interval_seconds,
            lock_ttl_seconds: config.lock_ttl_seconds,
            max_schedules_per_pass: config.max_schedules_per_pass,
            stale_run_minutes: config.stale_run_minutes,
            error_backoff_seconds: config.error_backoff_seconds,
        }
    }
}

/// What happened to one due schedule during a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Enqueued { run_id: Uuid, task_id: TaskId },
    /// Another instance holds `lock:<source_name>`
    LockHeld,
    /// A pending or running run already exists for the source
    RunActive { run_id: Uuid },
    PayloadInvalid { run_id: Uuid },
    EnqueueFailed { run_id: Uuid },
}

/// Per-schedule view for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub source_name: String,
    pub interval_minutes: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub lock_held: bool,
    pub last_run_status: Option<RunStatus>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled_schedules: usize,
    pub held_locks: Vec<String>,
    pub schedules: Vec<ScheduleStatus>,
}

/// Scheduler trait for scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the daemon loop until `stop` is called
    async fn start(&self) -> Result<(), SchedulerError>;

    async fn stop(&self) -> Result<(), SchedulerError>;

    /// One pass over due schedules; returns the number of fetch tasks enqueued
    async fn process_scheduled_sites(&self) -> Result<usize, SchedulerError>;
}

/// Scheduler service composed from explicit store, lock and queue handles
pub struct SchedulerService {
    config: SchedulerConfig,
    schedules: Arc<dyn ScheduleStore>,
    runs: Arc<dyn RunStore>,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<dyn QueueBridge>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl SchedulerService {
    pub fn new(
        config: SchedulerConfig,
        schedules: Arc<dyn ScheduleStore>,
        runs: Arc<dyn RunStore>,
        lock: Arc<dyn DistributedLock>,
        queue: Arc<dyn QueueBridge>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

        Self {
            config,
            schedules,
            runs,
            lock,
            queue,
            shutdown_tx,
        }
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lock_ttl_seconds)
    }

    /// Lock, fire and unlock one schedule. The lock is released on every path
    /// once acquired, including errors from `fire`.
    #[instrument(skip(self, schedule), fields(source_name = %schedule.source_name))]
    async fn process_schedule(&self, schedule: &SiteSchedule) -> Result<ScheduleOutcome, SchedulerError> {
        let key = schedule.lock_key();
        let token = new_lock_token();

        if !self.lock.acquire(&key, &token, self.lock_ttl()).await? {
            debug!(lock_key = %key, "Source locked by another instance, skipping");
            telemetry::record_lock_contention(&schedule.source_name);
            return Ok(ScheduleOutcome::LockHeld);
        }

        let outcome = self.fire(schedule, &token).await;

        match self.lock.release(&key, &token).await {
            Ok(ReleaseOutcome::Released) => debug!(lock_key = %key, "Lock released"),
            Ok(ReleaseOutcome::Expired) => {
                warn!(lock_key = %key, "Lock expired before release; lock_ttl_seconds is too short")
            }
            Err(e) => error!(lock_key = %key, error = %e, "Failed to release source lock"),
        }

        outcome
    }

    async fn fire(&self, schedule: &SiteSchedule, token: &str) -> Result<ScheduleOutcome, SchedulerError> {
        let stale_before = Utc::now() - chrono::Duration::minutes(self.config.stale_run_minutes);
        let abandoned = self
            .runs
            .fail_stale(
                &schedule.source_name,
                stale_before,
                "abandoned: no completion reported before stale timeout",
            )
            .await?;
        if abandoned > 0 {
            warn!(abandoned, "Failed stale active runs");
        }

        if let Some(active) = self.runs.find_active(&schedule.source_name).await? {
            debug!(run_id = %active.id, status = %active.status, "Run still active, skipping");
            return Ok(ScheduleOutcome::RunActive { run_id: active.id });
        }

        let run = ScrapeRun::pending(&schedule.source_name, token);
        self.runs.create(&run).await?;
        info!(run_id = %run.id, "Scrape run created");

        let payload = match parse_payload(&schedule.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let message = format!("payload parse failure: {}", e);
                warn!(run_id = %run.id, error = %e, "Schedule payload is invalid");
                self.fail_run(run.id, RunStatus::Pending, &message).await?;
                telemetry::record_run_failed(&schedule.source_name, "payload_parse");
                return Ok(ScheduleOutcome::PayloadInvalid { run_id: run.id });
            }
        };

        let task = QueueTask::Scrape {
            run_id: run.id,
            source_name: schedule.source_name.clone(),
            payload,
        };

        match self.queue.enqueue(&task).await {
            Ok(task_id) => {
                self.mark_enqueued(run.id).await?;
                info!(run_id = %run.id, task_id = %task_id, "Fetch task enqueued");
                telemetry::record_run_enqueued(&schedule.source_name);
                Ok(ScheduleOutcome::Enqueued {
                    run_id: run.id,
                    task_id,
                })
            }
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to enqueue fetch task");
                let message = format!("enqueue failure: {}", e);
                self.fail_run(run.id, RunStatus::Pending, &message).await?;
                telemetry::record_run_failed(&schedule.source_name, "enqueue");
                Ok(ScheduleOutcome::EnqueueFailed { run_id: run.id })
            }
        }
    }

    /// pending -> running after a successful enqueue. A worker that already
    /// picked the task up may have moved the run past pending; that still
    /// counts as enqueued.
    async fn mark_enqueued(&self, run_id: Uuid) -> Result<(), SchedulerError> {
        if self
            .runs
            .transition(run_id, RunStatus::Pending, RunStatus::Running, None)
            .await?
        {
            return Ok(());
        }

        let current = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Scrape run not found: {}", run_id)))?;
        match current.status {
            RunStatus::Running | RunStatus::Succeeded | RunStatus::Failed => {
                debug!(run_id = %run_id, status = %current.status, "Worker advanced the run before the scheduler");
                Ok(())
            }
            status => Err(RunTransitionError {
                run_id,
                from: status,
                to: RunStatus::Running,
            }
            .into()),
        }
    }

    async fn fail_run(&self, run_id: Uuid, from: RunStatus, message: &str) -> Result<(), SchedulerError> {
        self.move_run(run_id, from, RunStatus::Failed, Some(message)).await
    }

    async fn move_run(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
        message: Option<&str>,
    ) -> Result<(), SchedulerError> {
        if self.runs.transition(run_id, from, to, message).await? {
            return Ok(());
        }

        let current = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Scrape run not found: {}", run_id)))?;
        Err(RunTransitionError {
            run_id,
            from: current.status,
            to,
        }
        .into())
    }

    /// Push `next_run_at` to `now + interval`. Missed firings are not replayed.
    async fn advance(&self, schedule: &SiteSchedule, now: DateTime<Utc>) {
        let next_run_at = now + chrono::Duration::minutes(effective_interval_minutes(schedule));
        if let Err(e) = self
            .schedules
            .set_next_run_at(&schedule.source_name, next_run_at)
            .await
        {
            error!(source_name = %schedule.source_name, error = %e, "Failed to advance schedule");
        }
    }

    /// Completion report from the fetch worker: `running -> succeeded|failed`.
    ///
    /// A run still `pending` is moved to `running` first, since the worker can
    /// finish before the scheduler records the enqueue.
    #[instrument(skip(self, message))]
    pub async fn record_run_outcome(
        &self,
        run_id: Uuid,
        succeeded: bool,
        message: Option<&str>,
    ) -> Result<ScrapeRun, SchedulerError> {
        let run = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Scrape run not found: {}", run_id)))?;

        let target = if succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        if run.status.is_terminal() {
            error!(status = %run.status, "Outcome reported for a finished run");
            return Err(RunTransitionError {
                run_id,
                from: run.status,
                to: target,
            }
            .into());
        }

        if run.status == RunStatus::Pending {
            // Losing this race to the scheduler is fine; the row is running either way
            self.runs
                .transition(run_id, RunStatus::Pending, RunStatus::Running, None)
                .await?;
        }

        self.move_run(run_id, RunStatus::Running, target, message).await?;
        info!(source_name = %run.source_name, status = %target, "Scrape run finished");

        self.runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Scrape run not found: {}", run_id)).into())
    }

    /// Read-only snapshot: enabled schedules, next due times, held locks and latest run state
    #[instrument(skip(self))]
    pub async fn get_scheduler_status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let schedules = self.schedules.list_enabled().await?;
        let mut statuses = Vec::with_capacity(schedules.len());
        let mut held_locks = Vec::new();

        for schedule in &schedules {
            let key = lock_key(&schedule.source_name);
            let lock_held = self.lock.probe(&key).await?;
            if lock_held {
                held_locks.push(key);
            }

            let latest = self.runs.find_latest(&schedule.source_name).await?;
            let last_error = latest
                .as_ref()
                .filter(|run| run.status == RunStatus::Failed)
                .and_then(|run| run.message.clone());

            statuses.push(ScheduleStatus {
                source_name: schedule.source_name.clone(),
                interval_minutes: schedule.interval_minutes,
                next_run_at: schedule.next_run_at,
                lock_held,
                last_run_status: latest.map(|run| run.status),
                last_error,
            });
        }

        Ok(SchedulerStatus {
            enabled_schedules: schedules.len(),
            held_locks,
            schedules: statuses,
        })
    }
}

#[async_trait]
impl Scheduler for SchedulerService {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        info!(
            check_interval_seconds = self.config.check_interval_seconds,
            "Starting scheduler loop"
        );

        let mut ticker = interval(Duration::from_secs(self.config.check_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.process_scheduled_sites().await {
                        Ok(count) => info!(jobs_enqueued = count, "Scheduler pass complete"),
                        Err(e) => {
                            error!(
                                error = %e,
                                backoff_seconds = self.config.error_backoff_seconds,
                                "Scheduler pass failed, backing off"
                            );
                            tokio::select! {
                                _ = sleep(Duration::from_secs(self.config.error_backoff_seconds)) => {}
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("Scheduler loop stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SchedulerError> {
        info!("Stopping scheduler loop");
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    /// Schedules are handled one after another. A failure on one schedule is
    /// logged and the pass moves on; `next_run_at` advances for every schedule
    /// attempted, whatever the outcome.
    #[instrument(skip(self))]
    async fn process_scheduled_sites(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let due = self
            .schedules
            .find_due(now, self.config.max_schedules_per_pass)
            .await?;

        debug!(due = due.len(), "Found due schedules");

        let mut enqueued = 0;
        for schedule in &due {
            match self.process_schedule(schedule).await {
                Ok(ScheduleOutcome::Enqueued { .. }) => enqueued += 1,
                Ok(outcome) => debug!(source_name = %schedule.source_name, ?outcome, "Schedule not enqueued"),
                Err(e) => error!(
                    source_name = %schedule.source_name,
                    error = %e,
                    "Failed to process schedule"
                ),
            }

            self.advance(schedule, now).await;
        }

        Ok(enqueued)
    }
}

/// Schedule payloads must be JSON objects
fn parse_payload(raw: &str) -> Result<serde_json::Value, ValidationError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ValidationError::InvalidPayload(e.to_string()))?;
    if !value.is_object() {
        return Err(ValidationError::InvalidPayload(
            "payload must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn effective_interval_minutes(schedule: &SiteSchedule) -> i64 {
    if schedule.interval_minutes < 1 {
        warn!(
            source_name = %schedule.source_name,
            interval_minutes = schedule.interval_minutes,
            "Non-positive interval, using 1 minute"
        );
        return 1;
    }
    i64::from(schedule.interval_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.check_interval_seconds, 60);
        assert_eq!(config.lock_ttl_seconds, 300);
    }

    #[test]
    fn test_parse_payload() {
        assert!(parse_payload(r#"{"pages": 3}"#).is_ok());
        assert!(parse_payload("{not-json").is_err());
        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("").is_err());
    }

    #[test]
    fn test_effective_interval_clamps_non_positive() {
        let mut schedule = SiteSchedule::new("A", "{}", 0);
        assert_eq!(effective_interval_minutes(&schedule), 1);
        schedule.interval_minutes = 45;
        assert_eq!(effective_interval_minutes(&schedule), 45);
    }
}
