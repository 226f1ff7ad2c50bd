//! Pipeline repository port.
//!
//! Relational storage of pipeline records lives outside the core; the state
//! machine reaches it only through [`PipelineRepository`]. Writes are
//! last-write-wins except for two rules every implementation enforces: stage
//! outputs are write-once, and a terminal pipeline is never written again
//! (the one exception is an explicit retry reopening a `failed` pipeline).

mod consistency;
mod memory;

pub use consistency::wait_for_pipeline;
pub use memory::InMemoryPipelineRepository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Pipeline, PipelineStatus};
use crate::errors::PipelineError;

/// Errors raised by repositories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// No pipeline with this id.
    #[error("Pipeline not found: {0}")]
    NotFound(String),

    /// A pipeline with this id already exists.
    #[error("Pipeline already exists: {0}")]
    AlreadyExists(String),

    /// The pipeline is terminal and can no longer be written.
    #[error("Pipeline '{id}' is {status} and can no longer be updated")]
    Terminal {
        /// Pipeline id.
        id: String,
        /// Its terminal status.
        status: PipelineStatus,
    },

    /// The backing store is unreachable.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Returns true for errors a retry may fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Partial update of a pipeline record. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineUpdate {
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineStatus>,
    /// New current stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// New in-flight task; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Option<String>>,
    /// New retry count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Stage output to append. Ignored if the stage already has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_output: Option<(String, serde_json::Value)>,
    /// New progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Error to record; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<PipelineError>>,
    /// Allows writing a `failed` pipeline, for explicit stage retries.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reopen: bool,
}

impl PipelineUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: PipelineStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the current stage.
    #[must_use]
    pub fn with_current_stage(mut self, stage: impl Into<String>) -> Self {
        self.current_stage = Some(stage.into());
        self
    }

    /// Sets or clears the in-flight task.
    #[must_use]
    pub fn with_current_task(mut self, task_id: Option<String>) -> Self {
        self.current_task_id = Some(task_id);
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Appends a stage output.
    #[must_use]
    pub fn with_stage_output(mut self, stage: impl Into<String>, output: serde_json::Value) -> Self {
        self.stage_output = Some((stage.into(), output));
        self
    }

    /// Sets the progress.
    #[must_use]
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Records an error.
    #[must_use]
    pub fn with_error(mut self, error: PipelineError) -> Self {
        self.error = Some(Some(error));
        self
    }

    /// Clears the recorded error.
    #[must_use]
    pub fn clearing_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    /// Marks the update as an explicit retry of a failed pipeline.
    #[must_use]
    pub fn reopening(mut self) -> Self {
        self.reopen = true;
        self
    }

    /// Returns true if the update may be written to `pipeline`.
    ///
    /// Terminal pipelines reject every update except a reopening one on a
    /// `failed` pipeline.
    #[must_use]
    pub fn is_allowed_on(&self, pipeline: &Pipeline) -> bool {
        !pipeline.is_terminal() || (self.reopen && pipeline.status == PipelineStatus::Failed)
    }

    /// Applies the update to `pipeline` in place.
    ///
    /// Returns false if a stage output was requested but the stage already
    /// had one; every other field is still applied.
    pub fn apply_to(&self, pipeline: &mut Pipeline) -> bool {
        if let Some(status) = self.status {
            pipeline.status = status;
        }
        if let Some(ref stage) = self.current_stage {
            pipeline.current_stage = Some(stage.clone());
        }
        if let Some(ref task_id) = self.current_task_id {
            pipeline.current_task_id.clone_from(task_id);
        }
        if let Some(retry_count) = self.retry_count {
            pipeline.retry_count = retry_count;
        }
        if let Some(progress) = self.progress {
            pipeline.progress = progress;
        }
        if let Some(ref error) = self.error {
            pipeline.error.clone_from(error);
        }
        pipeline.updated_at = crate::utils::now_utc();
        match self.stage_output {
            Some((ref stage, ref output)) => pipeline.stage_outputs.insert(stage.clone(), output.clone()),
            None => true,
        }
    }
}

/// Storage for pipeline records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Stores a new record and returns its id.
    async fn create(&self, pipeline: &Pipeline) -> Result<String, RepositoryError>;

    /// Reads a record. May lag behind recent writes.
    async fn get(&self, id: &str) -> Result<Option<Pipeline>, RepositoryError>;

    /// Applies `update` and returns the updated record.
    async fn update(&self, id: &str, update: PipelineUpdate) -> Result<Pipeline, RepositoryError>;

    /// Every pipeline that is not terminal.
    async fn list_unfinished(&self) -> Result<Vec<Pipeline>, RepositoryError>;
}
