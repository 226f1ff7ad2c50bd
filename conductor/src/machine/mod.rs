//! Pipeline state machine.
//!
//! - [`transition`]: the pure `(pipeline, event) -> Transition` decision
//! - [`PipelineStateMachine`]: applies decisions with persistence and dispatch
//! - [`EventDeduplicator`], [`PipelineLocks`], [`TimeoutWatchdog`]: its parts

mod dedup;
mod locks;
mod state_machine;
mod transition;
mod watchdog;


pub use dedup::EventDeduplicator;
pub use locks::PipelineLocks;
pub use state_machine::{PipelineStateMachine, RecoveryReport};
pub use transition::{transition, IgnoreReason, Transition};
pub use watchdog::TimeoutWatchdog;

use async_trait::async_trait;

use crate::core::{NewPipeline, Pipeline};
use crate::errors::ConductorError;

/// Control operations exposed to an outer API layer.
#[async_trait]
pub trait PipelineControl: Send + Sync {
    /// Creates a pipeline and dispatches its first stage.
    async fn create_pipeline(&self, request: NewPipeline) -> Result<Pipeline, ConductorError>;

    /// Reads a pipeline.
    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>, ConductorError>;

    /// Cancels a non-terminal pipeline.
    async fn cancel_pipeline(&self, pipeline_id: &str, reason: &str) -> Result<Pipeline, ConductorError>;

    /// Re-dispatches the current stage of a failed pipeline.
    async fn retry_stage(&self, pipeline_id: &str) -> Result<Pipeline, ConductorError>;
}
