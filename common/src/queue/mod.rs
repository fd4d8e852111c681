// Queue module for NATS JetStream integration

pub mod memory;
pub mod nats;
pub mod publisher;

pub use memory::InMemoryQueue;
pub use nats::{NatsClient, NatsStreamConfig};
pub use publisher::{NatsQueueBridge, QueueBridge, QueueTask, TaskId, TaskMessage};
