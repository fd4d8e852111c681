// Review poller tests: ingestion through review hand-off

use async_trait::async_trait;
use common::db::InMemoryRecordStore;
use common::errors::QueueError;
use common::models::{ReviewStatus, ScrapedJob};
use common::persistence::JobPersistenceEngine;
use common::poller::{PollerConfig, PollerService};
use common::queue::{InMemoryQueue, QueueBridge, QueueTask, TaskId};
use mockall::{mock, Sequence};
use std::sync::Arc;

mock! {
    pub Queue {}

    #[async_trait]
    impl QueueBridge for Queue {
        async fn enqueue(&self, task: &QueueTask) -> Result<TaskId, QueueError>;
    }
}

async fn seeded_store(count: usize) -> InMemoryRecordStore {
    let store = InMemoryRecordStore::new();
    let engine = JobPersistenceEngine::new(Arc::new(store.clone()));
    let jobs: Vec<ScrapedJob> = (0..count)
        .map(|i| ScrapedJob::new(format!("Role {}", i), "Acme", format!("https://a.example/{}", i)))
        .collect();
    let result = engine.persist_jobs(&jobs, "A").await;
    assert_eq!(result.inserted, count);
    store
}

fn poller(store: &InMemoryRecordStore, queue: Arc<dyn QueueBridge>, batch_size: i64) -> PollerService {
    PollerService::new(
        PollerConfig {
            batch_size,
            ..PollerConfig::default()
        },
        Arc::new(store.clone()),
        queue,
    )
}

#[tokio::test]
async fn test_ingested_records_flow_to_review_queue() {
    let store = seeded_store(3).await;
    let queue = InMemoryQueue::new();
    let poller = poller(&store, Arc::new(queue.clone()), 50);

    assert_eq!(poller.get_pending_review_jobs(10).await.unwrap().len(), 3);
    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 3);

    let tasks = queue.tasks().await;
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        match task {
            QueueTask::Review { record_id, data } => {
                assert_eq!(data["id"], record_id.to_string());
                assert_eq!(data["source_name"], "A");
            }
            other => panic!("unexpected task: {:?}", other),
        }
    }
    assert!(poller.get_pending_review_jobs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_pending_set_returns_zero() {
    let store = InMemoryRecordStore::new();
    let queue = InMemoryQueue::new();
    let poller = poller(&store, Arc::new(queue.clone()), 50);

    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 0);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn test_batch_size_limits_one_poll() {
    let store = seeded_store(5).await;
    let queue = InMemoryQueue::new();
    let poller = poller(&store, Arc::new(queue.clone()), 2);

    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 2);
    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 2);
    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 1);
    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 0);
    assert_eq!(queue.len().await, 5);
}

#[tokio::test]
async fn test_failed_enqueue_leaves_record_pending() {
    let store = seeded_store(2).await;

    let mut queue = MockQueue::new();
    let mut seq = Sequence::new();
    queue
        .expect_enqueue()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(QueueError::PublishFailed("broker down".to_string())));
    queue
        .expect_enqueue()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(TaskId("SCRAPE:2".to_string())));

    let poller = poller(&store, Arc::new(queue), 50);
    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 1);

    let records = store.all().await;
    assert_eq!(records[0].review_status, ReviewStatus::PendingReview);
    assert_eq!(records[1].review_status, ReviewStatus::InReview);
}

#[tokio::test]
async fn test_review_error_is_not_re_enqueued() {
    let store = seeded_store(1).await;
    let queue = InMemoryQueue::new();
    let poller = poller(&store, Arc::new(queue.clone()), 50);

    poller.poll_and_enqueue_jobs().await.unwrap();
    let record_id = store.all().await[0].id;

    poller
        .record_review_error(record_id, "reviewer timed out")
        .await
        .unwrap();

    let record = &store.all().await[0];
    assert_eq!(record.review_status, ReviewStatus::InReview);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.error_message.as_deref(), Some("reviewer timed out"));

    assert_eq!(poller.poll_and_enqueue_jobs().await.unwrap(), 0);
    assert_eq!(queue.len().await, 1);

    poller.complete_review(record_id).await.unwrap();
    let record = &store.all().await[0];
    assert_eq!(record.review_status, ReviewStatus::Reviewed);
    assert!(record.error_message.is_none());
}

#[tokio::test]
async fn test_enqueue_job_review_does_not_change_status() {
    let store = seeded_store(1).await;
    let queue = InMemoryQueue::new();
    let poller = poller(&store, Arc::new(queue.clone()), 50);
    let record_id = store.all().await[0].id;

    let task_id = poller
        .enqueue_job_review(record_id, serde_json::json!({"title": "Role 0"}))
        .await
        .unwrap();

    assert_eq!(task_id, TaskId("memory:1".to_string()));
    assert_eq!(store.all().await[0].review_status, ReviewStatus::PendingReview);
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_polling_loop() {
    let store = seeded_store(2).await;
    let queue = InMemoryQueue::new();
    let poller = Arc::new(poller(&store, Arc::new(queue.clone()), 50));

    let runner = poller.clone();
    let handle = tokio::spawn(async move { runner.start_polling_loop().await });

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    poller.stop();

    handle.await.unwrap().unwrap();
    assert_eq!(queue.len().await, 2);
}
