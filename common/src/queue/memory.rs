// In-process FIFO queue

use crate::errors::QueueError;
use crate::queue::publisher::{QueueBridge, QueueTask, TaskId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct InMemoryQueue {
    tasks: Arc<Mutex<VecDeque<(TaskId, QueueTask)>>>,
    sequence: Arc<Mutex<u64>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of queued tasks, oldest first
    pub async fn tasks(&self) -> Vec<QueueTask> {
        self.tasks.lock().await.iter().map(|(_, t)| t.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Take the oldest task
    pub async fn pop(&self) -> Option<(TaskId, QueueTask)> {
        self.tasks.lock().await.pop_front()
    }
}

#[async_trait::async_trait]
impl QueueBridge for InMemoryQueue {
    async fn enqueue(&self, task: &QueueTask) -> Result<TaskId, QueueError> {
        let mut sequence = self.sequence.lock().await;
        *sequence += 1;
        let task_id = TaskId(format!("memory:{}", *sequence));
        self.tasks.lock().await.push_back((task_id.clone(), task.clone()));
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fifo_order_and_distinct_ids() {
        let queue = InMemoryQueue::new();
        let first = QueueTask::Review {
            record_id: Uuid::new_v4(),
            data: serde_json::json!({}),
        };
        let second = QueueTask::Review {
            record_id: Uuid::new_v4(),
            data: serde_json::json!({}),
        };

        let id1 = queue.enqueue(&first).await.unwrap();
        let id2 = queue.enqueue(&second).await.unwrap();
        assert_ne!(id1, id2);

        assert_eq!(queue.pop().await.unwrap().1, first);
        assert_eq!(queue.pop().await.unwrap().1, second);
        assert!(queue.is_empty().await);
    }
}
