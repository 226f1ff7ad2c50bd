//! Per-pipeline serialization.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Hands out one async mutex per pipeline id.
///
/// Events for one pipeline are applied one at a time; different pipelines
/// proceed in parallel.
#[derive(Debug, Default)]
pub struct PipelineLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PipelineLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `pipeline_id`.
    pub async fn acquire(&self, pipeline_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops the entry of a terminal pipeline.
    ///
    /// The entry is kept while another task holds or waits on the lock.
    pub fn release(&self, pipeline_id: &str) {
        self.locks
            .remove_if(pipeline_id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Pipelines with a lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_pipeline_is_serialized() {
        let locks = Arc::new(PipelineLocks::new());
        let guard = locks.acquire("p1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("p1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_pipelines_do_not_block() {
        let locks = PipelineLocks::new();
        let _a = locks.acquire("p1").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("p2"))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_release_removes_idle_entry() {
        let locks = PipelineLocks::new();
        let guard = locks.acquire("p1").await;
        locks.release("p1");
        drop(guard);
        assert!(locks.is_empty());
    }
}
