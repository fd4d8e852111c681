// Error handling framework
// Scheduling, locking, queueing and ingestion error taxonomy

use crate::models::RunStatus;
use thiserror::Error;

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Distributed lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    /// Release attempted with a token that does not own the lock.
    /// The lock is left untouched.
    #[error("Lock {key} is held by another owner; release with token {token} refused")]
    NotOwner { key: String, token: String },
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),
}

/// Record validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid schedule payload: {0}")]
    InvalidPayload(String),
}

/// Illegal scrape run state change
#[derive(Error, Debug)]
#[error("Scrape run {run_id} cannot move from {from} to {to}")]
pub struct RunTransitionError {
    pub run_id: uuid::Uuid,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Errors surfaced by a scheduler pass to the daemon loop
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transition(#[from] RunTransitionError),
}

/// Errors surfaced by a poller pass to the daemon loop
#[derive(Error, Debug)]
pub enum PollerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_owner_mentions_key() {
        let err = LockError::NotOwner {
            key: "lock:ExampleSite".to_string(),
            token: "t-1".to_string(),
        };
        assert!(err.to_string().contains("lock:ExampleSite"));
    }

    #[test]
    fn test_missing_field_message() {
        let err = ValidationError::MissingField("title");
        assert_eq!(err.to_string(), "missing required field: title");
    }

    #[test]
    fn test_transition_error_display() {
        let err = RunTransitionError {
            run_id: uuid::Uuid::nil(),
            from: RunStatus::Succeeded,
            to: RunStatus::Running,
        };
        assert!(err.to_string().contains("succeeded"));
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_scheduler_error_wraps_queue_error() {
        let err: SchedulerError = QueueError::Timeout("5s".to_string()).into();
        assert!(err.to_string().contains("timeout"));
    }
}
