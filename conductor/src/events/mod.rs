//! Pipeline lifecycle events.
//!
//! The state machine, the result consumer and the durable subscription report
//! what they did through an [`EventSink`]. Sinks are injected, never global.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;

/// Something observable happened to a pipeline or to the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// A pipeline record was created.
    #[serde(rename = "pipeline.created")]
    PipelineCreated {
        /// Pipeline id.
        pipeline_id: String,
        /// Pipeline type.
        pipeline_type: String,
    },
    /// A task envelope was published.
    #[serde(rename = "pipeline.stage_dispatched")]
    StageDispatched {
        /// Pipeline id.
        pipeline_id: String,
        /// Stage the task executes.
        stage: String,
        /// Task id.
        task_id: String,
        /// Worker type the task was routed to.
        worker_type: String,
        /// Explicit retry number.
        retry_count: u32,
    },
    /// A stage output was recorded.
    #[serde(rename = "pipeline.stage_completed")]
    StageCompleted {
        /// Pipeline id.
        pipeline_id: String,
        /// Completed stage.
        stage: String,
        /// Event id (the answering task id).
        event_id: String,
        /// Progress after the stage, 0 to 100.
        progress: f64,
    },
    /// Every stage completed.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted {
        /// Pipeline id.
        pipeline_id: String,
    },
    /// A worker failed or a stage timed out.
    #[serde(rename = "pipeline.failed")]
    PipelineFailed {
        /// Pipeline id.
        pipeline_id: String,
        /// Stage that failed.
        stage: Option<String>,
        /// Error code.
        code: String,
    },
    /// The pipeline was cancelled.
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled {
        /// Pipeline id.
        pipeline_id: String,
        /// Cancellation reason.
        reason: String,
    },
    /// A stream entry was moved to the dead-letter stream.
    #[serde(rename = "bus.dead_lettered")]
    DeadLettered {
        /// Source stream.
        stream: String,
        /// Entry id in the source stream.
        entry_id: String,
        /// Why it was dead-lettered.
        reason: String,
    },
}

impl LifecycleEvent {
    /// Dotted event type, e.g. `pipeline.completed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PipelineCreated { .. } => "pipeline.created",
            Self::StageDispatched { .. } => "pipeline.stage_dispatched",
            Self::StageCompleted { .. } => "pipeline.stage_completed",
            Self::PipelineCompleted { .. } => "pipeline.completed",
            Self::PipelineFailed { .. } => "pipeline.failed",
            Self::PipelineCancelled { .. } => "pipeline.cancelled",
            Self::DeadLettered { .. } => "bus.dead_lettered",
        }
    }

    /// Pipeline the event is about, if any.
    #[must_use]
    pub fn pipeline_id(&self) -> Option<&str> {
        match self {
            Self::PipelineCreated { pipeline_id, .. }
            | Self::StageDispatched { pipeline_id, .. }
            | Self::StageCompleted { pipeline_id, .. }
            | Self::PipelineCompleted { pipeline_id }
            | Self::PipelineFailed { pipeline_id, .. }
            | Self::PipelineCancelled { pipeline_id, .. } => Some(pipeline_id),
            Self::DeadLettered { .. } => None,
        }
    }

    /// JSON rendering, including the `type` tag.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = LifecycleEvent::StageDispatched {
            pipeline_id: "p1".into(),
            stage: "build".into(),
            task_id: "t1".into(),
            worker_type: "compiler".into(),
            retry_count: 0,
        };
        let dict = event.to_dict();
        assert_eq!(dict["type"], event.event_type());
        assert_eq!(dict["stage"], "build");
        assert_eq!(event.pipeline_id(), Some("p1"));
    }

    #[test]
    fn test_dead_letter_has_no_pipeline() {
        let event = LifecycleEvent::DeadLettered {
            stream: "stream:results".into(),
            entry_id: "5-0".into(),
            reason: "not json".into(),
        };
        assert_eq!(event.pipeline_id(), None);
        assert_eq!(event.to_dict()["type"], "bus.dead_lettered");
    }
}
