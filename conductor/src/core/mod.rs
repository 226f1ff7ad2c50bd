//! Core domain model types.
//!
//! - Pipeline status enum
//! - The pipeline record with append-only stage outputs
//! - Events that drive the state machine

mod event;
mod pipeline;
mod status;

pub use event::{PipelineEvent, StageCompleteEvent, StageOutcome};
pub use pipeline::{NewPipeline, Pipeline, StageOutputs};
pub use status::PipelineStatus;
