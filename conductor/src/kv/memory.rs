//! In-memory key-value store with lazy expiry.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::{KeyValueStore, KvError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &serde_json::Value, ttl: Option<Duration>) -> Self {
        Self {
            value: value.clone(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process [`KeyValueStore`]. Expired entries are removed on access.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, stored| !stored.is_expired());
        entries.len()
    }

    /// Returns true if no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("in-memory store is offline".into()))
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        self.check_available()?;
        self.entries
            .lock()
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|stored| !stored.is_expired()) {
            return Ok(false);
        }
        entries.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.check_available()?;
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|stored| !stored.is_expired()))
    }
}
