//! In-memory pipeline repository.
//!
//! Can simulate the two behaviours of a real backing store the state machine
//! must tolerate: read-after-create lag and outages.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{PipelineRepository, PipelineUpdate, RepositoryError};
use crate::core::Pipeline;

#[derive(Debug, Clone)]
struct StoredPipeline {
    pipeline: Pipeline,
    visible_at: Instant,
}

/// In-process [`PipelineRepository`].
#[derive(Debug)]
pub struct InMemoryPipelineRepository {
    pipelines: RwLock<HashMap<String, StoredPipeline>>,
    read_lag: Duration,
    available: AtomicBool,
    updates: AtomicUsize,
}

impl Default for InMemoryPipelineRepository {
    fn default() -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            read_lag: Duration::ZERO,
            available: AtomicBool::new(true),
            updates: AtomicUsize::new(0),
        }
    }
}

impl InMemoryPipelineRepository {
    /// Creates an empty repository with immediate reads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hides newly created records from `get` for `lag`.
    #[must_use]
    pub fn with_read_lag(mut self, lag: Duration) -> Self {
        self.read_lag = lag;
        self
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Successful updates so far.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Reads a record ignoring read lag.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<Pipeline> {
        self.pipelines.read().get(id).map(|stored| stored.pipeline.clone())
    }

    /// Stores a record as is, visible immediately. For seeding tests.
    pub fn insert(&self, pipeline: Pipeline) {
        self.pipelines.write().insert(
            pipeline.id.clone(),
            StoredPipeline {
                pipeline,
                visible_at: Instant::now(),
            },
        );
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Unavailable("in-memory repository is offline".into()))
        }
    }
}

#[async_trait]
impl PipelineRepository for InMemoryPipelineRepository {
    async fn create(&self, pipeline: &Pipeline) -> Result<String, RepositoryError> {
        self.check_available()?;
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&pipeline.id) {
            return Err(RepositoryError::AlreadyExists(pipeline.id.clone()));
        }
        pipelines.insert(
            pipeline.id.clone(),
            StoredPipeline {
                pipeline: pipeline.clone(),
                visible_at: Instant::now() + self.read_lag,
            },
        );
        Ok(pipeline.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Pipeline>, RepositoryError> {
        self.check_available()?;
        Ok(self
            .pipelines
            .read()
            .get(id)
            .filter(|stored| Instant::now() >= stored.visible_at)
            .map(|stored| stored.pipeline.clone()))
    }

    async fn update(&self, id: &str, update: PipelineUpdate) -> Result<Pipeline, RepositoryError> {
        self.check_available()?;
        let mut pipelines = self.pipelines.write();
        let stored = pipelines
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        if !update.is_allowed_on(&stored.pipeline) {
            return Err(RepositoryError::Terminal {
                id: id.to_string(),
                status: stored.pipeline.status,
            });
        }
        if !update.apply_to(&mut stored.pipeline) {
            debug!(pipeline_id = id, "Stage output already recorded, kept existing value");
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored.pipeline.clone())
    }

    async fn list_unfinished(&self) -> Result<Vec<Pipeline>, RepositoryError> {
        self.check_available()?;
        let mut unfinished: Vec<Pipeline> = self
            .pipelines
            .read()
            .values()
            .filter(|stored| !stored.pipeline.is_terminal())
            .map(|stored| stored.pipeline.clone())
            .collect();
        unfinished.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(unfinished)
    }
}
