// Database layer module
// Postgres-backed stores plus in-memory stores for tests and dry runs

pub mod memory;
pub mod pool;
pub mod redis;
pub mod repositories;

pub use memory::{InMemoryRecordStore, InMemoryRunStore, InMemoryScheduleStore};
pub use pool::DbPool;
pub use redis::RedisPool;
