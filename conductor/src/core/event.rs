//! Events consumed by the pipeline state machine.

use serde::{Deserialize, Serialize};

use crate::contracts::{ResultError, TraceContext};

/// What a completed stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The worker succeeded; `result` becomes the stage output.
    Succeeded {
        /// Opaque worker result.
        result: serde_json::Value,
    },
    /// The worker reported a failure.
    Failed {
        /// Worker supplied error, preserved verbatim.
        error: ResultError,
    },
}

/// Internal, deduplicated signal that a stage's worker answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCompleteEvent {
    /// Pipeline the result belongs to.
    pub pipeline_id: String,
    /// Stage the result answers.
    pub stage: String,
    /// Deduplication key; the result envelope's `task_id`.
    pub event_id: String,
    /// What the stage produced.
    #[serde(flatten)]
    pub outcome: StageOutcome,
    /// Trace of the task that produced the result, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl StageCompleteEvent {
    /// Creates a success event.
    #[must_use]
    pub fn succeeded(
        pipeline_id: impl Into<String>,
        stage: impl Into<String>,
        event_id: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage: stage.into(),
            event_id: event_id.into(),
            outcome: StageOutcome::Succeeded { result },
            trace: None,
        }
    }

    /// Creates a failure event.
    #[must_use]
    pub fn failed(
        pipeline_id: impl Into<String>,
        stage: impl Into<String>,
        event_id: impl Into<String>,
        error: ResultError,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage: stage.into(),
            event_id: event_id.into(),
            outcome: StageOutcome::Failed { error },
            trace: None,
        }
    }

    /// Attaches the originating trace.
    #[must_use]
    pub fn with_trace(mut self, trace: Option<TraceContext>) -> Self {
        self.trace = trace;
        self
    }

    /// Returns true if the worker succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageOutcome::Succeeded { .. })
    }
}

/// Everything that can drive a pipeline transition.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A worker answered for a stage.
    StageComplete(StageCompleteEvent),
    /// The watchdog for a dispatched task fired.
    StageTimedOut {
        /// Pipeline id.
        pipeline_id: String,
        /// Stage that was waiting.
        stage: String,
        /// Task the watchdog was armed for.
        task_id: String,
        /// Window that elapsed.
        timeout_ms: u64,
    },
    /// Cancellation was requested.
    Cancel {
        /// Pipeline id.
        pipeline_id: String,
        /// Why.
        reason: String,
    },
}

impl PipelineEvent {
    /// Pipeline the event targets.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        match self {
            Self::StageComplete(event) => &event.pipeline_id,
            Self::StageTimedOut { pipeline_id, .. } | Self::Cancel { pipeline_id, .. } => {
                pipeline_id
            }
        }
    }

    /// Short event name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StageComplete(_) => "stage_complete",
            Self::StageTimedOut { .. } => "stage_timed_out",
            Self::Cancel { .. } => "cancel",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_succeeded_event() {
        let event = StageCompleteEvent::succeeded("p1", "init", "t1", json!({"ok": true}));
        assert!(event.is_success());
        assert_eq!(event.event_id, "t1");
    }

    #[test]
    fn test_event_serialization_flattens_outcome() {
        let event = StageCompleteEvent::failed("p1", "build", "t2", ResultError::new("E", "boom"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["error"]["code"], "E");

        let back: StageCompleteEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_pipeline_event_accessors() {
        let event = PipelineEvent::Cancel {
            pipeline_id: "p9".into(),
            reason: "user".into(),
        };
        assert_eq!(event.pipeline_id(), "p9");
        assert_eq!(event.kind(), "cancel");
    }
}
