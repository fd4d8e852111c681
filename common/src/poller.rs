// Review poller: forwards pending_review records to the review queue

use crate::db::repositories::RecordStore;
use crate::errors::{DatabaseError, PollerError, QueueError};
use crate::models::ScrapedRecord;
use crate::queue::{QueueBridge, QueueTask, TaskId};
use crate::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval_seconds: u64,
    /// Records fetched per poll
    pub batch_size: i64,
    pub error_backoff_seconds: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            batch_size: 50,
            error_backoff_seconds: 120,
        }
    }
}

impl From<&crate::config::PollerConfig> for PollerConfig {
    fn from(config: &crate::config::PollerConfig) -> Self {
        Self {
            interval_seconds: config.interval_seconds,
            batch_size: config.batch_size,
            error_backoff_seconds: config.error_backoff_seconds,
        }
    }
}

pub struct PollerService {
    config: PollerConfig,
    records: Arc<dyn RecordStore>,
    queue: Arc<dyn QueueBridge>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl PollerService {
    pub fn new(config: PollerConfig, records: Arc<dyn RecordStore>, queue: Arc<dyn QueueBridge>) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

        Self {
            config,
            records,
            queue,
            shutdown_tx,
        }
    }

    /// Up to `limit` records awaiting review, oldest first
    pub async fn get_pending_review_jobs(&self, limit: i64) -> Result<Vec<ScrapedRecord>, PollerError> {
        Ok(self.records.find_pending_review(limit).await?)
    }

    /// Push one review task; the record's status is left untouched
    #[instrument(skip(self, data))]
    pub async fn enqueue_job_review(&self, record_id: Uuid, data: serde_json::Value) -> Result<TaskId, PollerError> {
        let task = QueueTask::Review { record_id, data };
        Ok(self.queue.enqueue(&task).await?)
    }

    /// One poll: enqueue each pending record, then mark it in_review.
    ///
    /// A record is marked only after its enqueue succeeds, so a failed enqueue
    /// leaves it pending for the next poll. Returns an error only when every
    /// enqueue in a non-empty batch failed.
    #[instrument(skip(self))]
    pub async fn poll_and_enqueue_jobs(&self) -> Result<usize, PollerError> {
        match self.records.count_pending_review().await {
            Ok(pending) => telemetry::update_review_pending(pending),
            Err(e) => warn!(error = %e, "Failed to count pending records"),
        }

        let pending = self.get_pending_review_jobs(self.config.batch_size).await?;
        if pending.is_empty() {
            debug!("No records pending review");
            return Ok(0);
        }

        let mut enqueued = 0;
        let mut last_error: Option<QueueError> = None;

        for record in &pending {
            let data = match serde_json::to_value(record) {
                Ok(data) => data,
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "Failed to serialize record");
                    last_error = Some(e.into());
                    continue;
                }
            };

            let task_id = match self.enqueue_job_review(record.id, data).await {
                Ok(task_id) => task_id,
                Err(PollerError::Queue(e)) => {
                    error!(record_id = %record.id, error = %e, "Failed to enqueue review task");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.records.mark_in_review(record.id).await {
                Ok(true) => {
                    debug!(record_id = %record.id, task_id = %task_id, "Record sent for review");
                    enqueued += 1;
                }
                Ok(false) => {
                    warn!(record_id = %record.id, "Record left pending_review before it could be marked")
                }
                // Stays pending; the broker drops the repeat publish by message id
                Err(e) => error!(record_id = %record.id, error = %e, "Failed to mark record in_review"),
            }
        }

        telemetry::record_review_enqueued(enqueued);

        if enqueued == 0 {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }

        info!(enqueued, fetched = pending.len(), "Review poll complete");
        Ok(enqueued)
    }

    /// Review worker callback: in_review -> reviewed
    #[instrument(skip(self))]
    pub async fn complete_review(&self, record_id: Uuid) -> Result<(), PollerError> {
        if self.records.mark_reviewed(record_id).await? {
            return Ok(());
        }
        Err(self.not_in_review(record_id).await)
    }

    /// Review worker callback for a failed attempt. The record stays in_review
    /// and is not re-enqueued.
    #[instrument(skip(self, message))]
    pub async fn record_review_error(&self, record_id: Uuid, message: &str) -> Result<(), PollerError> {
        if self.records.record_review_error(record_id, message).await? {
            warn!(error = message, "Review attempt failed");
            return Ok(());
        }
        Err(self.not_in_review(record_id).await)
    }

    async fn not_in_review(&self, record_id: Uuid) -> PollerError {
        match self.records.find_by_id(record_id).await {
            Ok(Some(record)) => DatabaseError::QueryFailed(format!(
                "Record {} is {}, not in_review",
                record_id, record.review_status
            ))
            .into(),
            Ok(None) => DatabaseError::NotFound(format!("Record not found: {}", record_id)).into(),
            Err(e) => e.into(),
        }
    }

    /// Poll on a fixed interval until `stop` is called. A failed poll backs off
    /// for `error_backoff_seconds` before the next one.
    pub async fn start_polling_loop(&self) -> Result<(), PollerError> {
        info!(
            interval_seconds = self.config.interval_seconds,
            batch_size = self.config.batch_size,
            "Starting review poller"
        );

        let mut ticker = interval(Duration::from_secs(self.config.interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_and_enqueue_jobs().await {
                        error!(
                            error = %e,
                            backoff_seconds = self.config.error_backoff_seconds,
                            "Review poll failed, backing off"
                        );
                        tokio::select! {
                            _ = sleep(Duration::from_secs(self.config.error_backoff_seconds)) => {}
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping poller");
                    break;
                }
            }
        }

        info!("Review poller stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
