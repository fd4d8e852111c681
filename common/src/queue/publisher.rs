// Queue bridge: push-only access to the fetch and review work queues

use crate::errors::QueueError;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::context::PublishAckFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Opaque identifier returned by the queue for an accepted task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work item pushed downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueTask {
    /// Fetch job for a worker
    Scrape {
        run_id: Uuid,
        source_name: String,
        payload: serde_json::Value,
    },
    /// Persisted record awaiting review
    Review {
        record_id: Uuid,
        data: serde_json::Value,
    },
}

impl QueueTask {
    /// Stable id used for broker-side deduplication
    pub fn message_id(&self) -> String {
        match self {
            QueueTask::Scrape { run_id, .. } => format!("scrape-{}", run_id),
            QueueTask::Review { record_id, .. } => format!("review-{}", record_id),
        }
    }

    pub fn subject(&self) -> String {
        match self {
            QueueTask::Scrape { source_name, .. } => format!("scrape.{}", subject_token(source_name)),
            QueueTask::Review { .. } => "review.jobs".to_string(),
        }
    }
}

/// Wire envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(flatten)]
    pub task: QueueTask,
    pub published_at: DateTime<Utc>,
}

/// NATS subject tokens cannot contain dots, spaces or wildcards.
///
/// ASCII alphanumerics and `-` pass through; every other byte, `_` included,
/// becomes `_xx` (lowercase hex). The escape is injective, so distinct source
/// names never share a subject.
fn subject_token(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    let mut token = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            token.push(byte as char);
        } else {
            token.push('_');
            token.push_str(&hex::encode([byte]));
        }
    }
    token
}

/// Push-only FIFO work queue
#[async_trait::async_trait]
pub trait QueueBridge: Send + Sync {
    /// Enqueue a task; returns once the queue has confirmed receipt
    async fn enqueue(&self, task: &QueueTask) -> Result<TaskId, QueueError>;
}

/// JetStream-backed queue bridge
pub struct NatsQueueBridge {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsQueueBridge {
    pub fn new(client: NatsClient) -> Self {
        Self {
            client,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait::async_trait]
impl QueueBridge for NatsQueueBridge {
    #[instrument(skip(self, task), fields(message_id = %task.message_id()))]
    async fn enqueue(&self, task: &QueueTask) -> Result<TaskId, QueueError> {
        let message = TaskMessage {
            task: task.clone(),
            published_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&message)?;
        let subject = task.subject();

        // Nats-Msg-Id lets the stream drop re-publishes inside its duplicate window
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", task.message_id().as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(ack)) => {
                if ack.duplicate {
                    warn!(subject = %subject, "Queue reported duplicate message id");
                }
                let task_id = TaskId(format!("{}:{}", ack.stream, ack.sequence));
                info!(subject = %subject, task_id = %task_id, "Task enqueued");
                Ok(task_id)
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_subject_is_sanitized() {
        let task = QueueTask::Scrape {
            run_id: Uuid::nil(),
            source_name: "Example Site.com".to_string(),
            payload: serde_json::json!({}),
        };
        assert_eq!(task.subject(), "scrape.Example_20Site_2ecom");
    }

    #[test]
    fn test_subject_tokens_do_not_collide() {
        let names = ["Example Site.com", "Example_Site_com", "Example-Site-com", "", "_"];
        let tokens: std::collections::HashSet<String> =
            names.iter().map(|name| subject_token(name)).collect();
        assert_eq!(tokens.len(), names.len());
        assert_eq!(subject_token("Example_Site_com"), "Example_5fSite_5fcom");
        assert_eq!(subject_token("acme-jobs42"), "acme-jobs42");
    }

    #[test]
    fn test_message_ids_are_stable_per_entity() {
        let record_id = Uuid::new_v4();
        let task = QueueTask::Review {
            record_id,
            data: serde_json::json!({"title": "Engineer"}),
        };
        assert_eq!(task.message_id(), format!("review-{}", record_id));
        assert_eq!(task.subject(), "review.jobs");
    }

    #[test]
    fn test_task_message_wire_format() {
        let run_id = Uuid::new_v4();
        let message = TaskMessage {
            task: QueueTask::Scrape {
                run_id,
                source_name: "ExampleSite".to_string(),
                payload: serde_json::json!({"pages": 2}),
            },
            published_at: Utc::now(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "scrape");
        assert_eq!(json["run_id"], run_id.to_string());
        assert_eq!(json["payload"]["pages"], 2);
        assert!(json.get("published_at").is_some());
    }
}
