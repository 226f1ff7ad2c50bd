//! Envelope contracts binding orchestrator and workers to one schema.
//!
//! This module provides:
//! - The task envelope (orchestrator to worker)
//! - The result envelope (worker to orchestrator)
//! - The pinned schema version and the validation shared by both ends

mod result;
mod schema;
mod task;
mod trace;

pub use result::{ResultEnvelope, ResultError, ResultMetrics, ResultStatus};
pub use schema::{is_valid_identifier, Envelope, SCHEMA_VERSION};
pub use task::{
    task_topic, PipelineContext, Priority, TaskConstraints, TaskEnvelope, TaskMetadata,
};
pub use trace::TraceContext;
