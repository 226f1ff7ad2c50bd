//! Key-value store port for short-lived orchestration state.
//!
//! Holds task records (`task:<task_id>`) and deduplication markers
//! (`event:<pipeline_id>:<event_id>`), both with a TTL so the store does not
//! grow for the life of the deployment.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryKeyValueStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisKeyValueStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by key-value stores.
#[derive(Debug, Error)]
pub enum KvError {
    /// The store is unreachable.
    #[error("Key-value store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis returned an error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// JSON key-value store with optional per-key TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError>;

    /// Writes a value, replacing any existing one.
    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    /// Writes a value only if the key is absent. Returns true if written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Deletes a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;
}

/// Key of the record written when a task is dispatched.
#[must_use]
pub fn task_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Key marking an event as applied to a pipeline.
#[must_use]
pub fn event_key(pipeline_id: &str, event_id: &str) -> String {
    format!("event:{pipeline_id}:{event_id}")
}
