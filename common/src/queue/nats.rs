// NATS JetStream client for the fetch and review work queues

use crate::errors::QueueError;
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

/// JetStream stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsStreamConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    pub stream_name: String,
    /// Subjects captured by the stream
    pub subjects: Vec<String>,
    /// Maximum age for messages in the stream (in seconds)
    pub max_age_seconds: u64,
    pub max_messages: i64,
    /// Window in which a repeated `Nats-Msg-Id` is dropped (in seconds)
    pub duplicate_window_seconds: u64,
}

impl Default for NatsStreamConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "SCRAPE".to_string(),
            subjects: vec!["scrape.>".to_string(), "review.>".to_string()],
            max_age_seconds: 86400, // 24 hours
            max_messages: 1_000_000,
            duplicate_window_seconds: 120,
        }
    }
}

impl From<&crate::config::NatsConfig> for NatsStreamConfig {
    fn from(config: &crate::config::NatsConfig) -> Self {
        Self {
            url: config.url.clone(),
            stream_name: config.stream_name.clone(),
            ..Default::default()
        }
    }
}

/// NATS JetStream client
pub struct NatsClient {
    jetstream: JetStreamContext,
    config: NatsStreamConfig,
}

impl NatsClient {
    /// Create a new NATS client and connect to the server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsStreamConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server successfully");

        let jetstream = async_nats::jetstream::new(client);

        Ok(Self { jetstream, config })
    }

    /// Create or fetch the work-queue stream
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        info!(
            stream_name = %self.config.stream_name,
            "Initializing JetStream stream"
        );

        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: self.config.subjects.clone(),
            retention: RetentionPolicy::WorkQueue, // Messages deleted after acknowledgment
            max_age: Duration::from_secs(self.config.max_age_seconds),
            max_messages: self.config.max_messages,
            duplicate_window: Duration::from_secs(self.config.duplicate_window_seconds),
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(
            stream_name = %self.config.stream_name,
            "Stream initialized successfully"
        );

        Ok(stream)
    }

    /// Get the JetStream context for publishing
    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_default_subjects() {
        let config = NatsStreamConfig::default();
        assert_eq!(config.stream_name, "SCRAPE");
        assert!(config.subjects.contains(&"scrape.>".to_string()));
        assert!(config.subjects.contains(&"review.>".to_string()));
    }

    #[test]
    fn test_stream_config_from_settings() {
        let settings = crate::config::NatsConfig {
            url: "nats://queue:4222".to_string(),
            stream_name: "CUSTOM".to_string(),
        };
        let config = NatsStreamConfig::from(&settings);
        assert_eq!(config.url, "nats://queue:4222");
        assert_eq!(config.stream_name, "CUSTOM");
        assert_eq!(config.max_age_seconds, 86400);
    }
}
