//! Event deduplication.
//!
//! Two layers: a bounded in-process set of recently applied event ids and
//! `event:<pipeline_id>:<event_id>` markers in the key-value store that
//! survive restarts and are shared between orchestrator instances.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConductorError;
use crate::kv::{event_key, KeyValueStore};

/// Bounded set that forgets its oldest entries first.
#[derive(Debug)]
struct RecentSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    fn insert(&mut self, key: String) {
        if !self.members.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

/// Remembers which stage-complete events were applied.
pub struct EventDeduplicator {
    recent: Mutex<RecentSet>,
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl std::fmt::Debug for EventDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDeduplicator")
            .field("recent", &self.recent.lock().order.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl EventDeduplicator {
    /// Creates a deduplicator keeping `capacity` ids locally and markers for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            recent: Mutex::new(RecentSet::new(capacity)),
            store,
            ttl,
        }
    }

    /// Returns true if the event was already applied.
    pub async fn is_seen(&self, pipeline_id: &str, event_id: &str) -> Result<bool, ConductorError> {
        let key = event_key(pipeline_id, event_id);
        if self.recent.lock().contains(&key) {
            return Ok(true);
        }
        let seen = self.store.get(&key).await?.is_some();
        if seen {
            self.recent.lock().insert(key);
        }
        Ok(seen)
    }

    /// Records that the event was applied. Call only after the transition is persisted.
    pub async fn mark_seen(&self, pipeline_id: &str, event_id: &str) -> Result<(), ConductorError> {
        let key = event_key(pipeline_id, event_id);
        let marker = serde_json::json!({ "applied_at": crate::utils::now_utc() });
        self.store.set(&key, &marker, Some(self.ttl)).await?;
        self.recent.lock().insert(key);
        Ok(())
    }

    /// Records the event locally only, e.g. after a terminal write.
    pub fn remember(&self, pipeline_id: &str, event_id: &str) {
        self.recent.lock().insert(event_key(pipeline_id, event_id));
    }
}
