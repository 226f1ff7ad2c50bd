//! Redis key-value store. Values are stored as JSON text.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::{KeyValueStore, KvError};

/// [`KeyValueStore`] backed by Redis strings with `PX` expiry.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    redis: ConnectionManager,
    namespace: String,
}

impl std::fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValueStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl RedisKeyValueStore {
    /// Connects to `redis_url`. Keys are prefixed with `namespace:` when it is non-empty.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        Ok(Self::from_connection(redis, namespace))
    }

    /// Wraps an existing connection manager.
    #[must_use]
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.namespace)
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError> {
        let mut conn = self.redis.clone();
        let text: Option<String> = conn.get(self.key(key)).await?;
        text.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(KvError::from)
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let text = serde_json::to_string(value)?;
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(text);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let text = serde_json::to_string(value)?;
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(text).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.del(self.key(key)).await?;
        Ok(removed > 0)
    }
}
