//! The pure `(pipeline, event) -> transition` function.
//!
//! Nothing here performs I/O. [`super::PipelineStateMachine`] reads the
//! record, asks [`transition`] what to do, then applies the effects.

use serde::Serialize;
use std::fmt;

use crate::catalog::{StageCatalog, StageDefinition};
use crate::core::{Pipeline, PipelineEvent, PipelineStatus, StageCompleteEvent, StageOutcome};
use crate::errors::PipelineError;

/// Why an event leaves a pipeline untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    /// The event id was already applied.
    Duplicate,
    /// The pipeline is completed, failed or cancelled.
    Terminal {
        /// Its status.
        status: PipelineStatus,
    },
    /// The pipeline is not waiting for any stage.
    NotRunning {
        /// Its status.
        status: PipelineStatus,
    },
    /// The event answers a stage other than the current one.
    StageMismatch {
        /// Current stage of the pipeline.
        current: Option<String>,
        /// Stage the event answers.
        received: String,
    },
    /// The event answers an earlier task of the current stage.
    SupersededTask {
        /// Task the pipeline waits for.
        current: String,
        /// Task the event answers.
        received: String,
    },
    /// The watchdog fired for a task the pipeline no longer waits for.
    StaleTimeout,
    /// The pipeline type or stage is not in the catalog.
    UnknownStage {
        /// Pipeline type.
        pipeline_type: String,
        /// Stage name.
        stage: String,
    },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate event"),
            Self::Terminal { status } => write!(f, "pipeline is {status}"),
            Self::NotRunning { status } => write!(f, "pipeline is {status}, no stage in flight"),
            Self::StageMismatch { current, received } => write!(
                f,
                "event for stage '{received}' but current stage is '{}'",
                current.as_deref().unwrap_or("<none>")
            ),
            Self::SupersededTask { current, received } => {
                write!(f, "task '{received}' superseded by '{current}'")
            }
            Self::StaleTimeout => write!(f, "stale timeout"),
            Self::UnknownStage {
                pipeline_type,
                stage,
            } => write!(f, "stage '{stage}' is not part of pipeline type '{pipeline_type}'"),
        }
    }
}

/// What should happen to a pipeline in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Leave the pipeline as it is.
    Ignore(IgnoreReason),
    /// Record the stage output and dispatch `next`.
    Advance {
        /// Stage to dispatch.
        next: StageDefinition,
    },
    /// Record the stage output; every stage is done.
    Complete,
    /// Move to `failed` with this error.
    Fail(PipelineError),
    /// Move to `cancelled`.
    Cancel {
        /// Why.
        reason: String,
    },
}

impl Transition {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ignore(_) => "ignore",
            Self::Advance { .. } => "advance",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Decides the transition for `event` applied to `snapshot`.
///
/// Deduplication by event id happens before this is called; this function
/// only sees events that were never applied.
#[must_use]
pub fn transition(snapshot: &Pipeline, event: &PipelineEvent, catalog: &StageCatalog) -> Transition {
    if snapshot.is_terminal() {
        return Transition::Ignore(IgnoreReason::Terminal {
            status: snapshot.status,
        });
    }

    match event {
        PipelineEvent::Cancel { reason, .. } => Transition::Cancel {
            reason: reason.clone(),
        },
        PipelineEvent::StageTimedOut {
            stage,
            task_id,
            timeout_ms,
            ..
        } => {
            let waiting = snapshot.status == PipelineStatus::Running
                && snapshot.current_stage.as_deref() == Some(stage.as_str())
                && snapshot.current_task_id.as_deref() == Some(task_id.as_str());
            if waiting {
                Transition::Fail(PipelineError::timeout(stage.clone(), *timeout_ms))
            } else {
                Transition::Ignore(IgnoreReason::StaleTimeout)
            }
        }
        PipelineEvent::StageComplete(complete) => stage_complete(snapshot, complete, catalog),
    }
}

fn stage_complete(
    snapshot: &Pipeline,
    event: &StageCompleteEvent,
    catalog: &StageCatalog,
) -> Transition {
    if !matches!(
        snapshot.status,
        PipelineStatus::Running | PipelineStatus::Evaluating
    ) {
        return Transition::Ignore(IgnoreReason::NotRunning {
            status: snapshot.status,
        });
    }
    if snapshot.current_stage.as_deref() != Some(event.stage.as_str()) {
        return Transition::Ignore(IgnoreReason::StageMismatch {
            current: snapshot.current_stage.clone(),
            received: event.stage.clone(),
        });
    }
    if let Some(current) = snapshot.current_task_id.as_deref() {
        if current != event.event_id {
            return Transition::Ignore(IgnoreReason::SupersededTask {
                current: current.to_string(),
                received: event.event_id.clone(),
            });
        }
    }

    match &event.outcome {
        StageOutcome::Failed { error } => Transition::Fail(PipelineError::worker(&event.stage, error)),
        StageOutcome::Succeeded { .. } => {
            if catalog.stage(&snapshot.pipeline_type, &event.stage).is_none() {
                return Transition::Ignore(IgnoreReason::UnknownStage {
                    pipeline_type: snapshot.pipeline_type.clone(),
                    stage: event.stage.clone(),
                });
            }
            match catalog.next_stage(&snapshot.pipeline_type, &event.stage) {
                Some(next) => Transition::Advance { next: next.clone() },
                None => Transition::Complete,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ResultError;
    use crate::core::NewPipeline;
    use crate::errors::PipelineErrorKind;
    use crate::testing::fixtures::app_catalog;
    use serde_json::json;

    fn running(stage: &str, task_id: &str) -> Pipeline {
        let mut pipeline = Pipeline::from_request(&NewPipeline::new("app", "demo"));
        pipeline.status = PipelineStatus::Running;
        pipeline.current_stage = Some(stage.into());
        pipeline.current_task_id = Some(task_id.into());
        pipeline
    }

    fn success(pipeline: &Pipeline, stage: &str, task_id: &str) -> PipelineEvent {
        PipelineEvent::StageComplete(StageCompleteEvent::succeeded(
            pipeline.id.clone(),
            stage,
            task_id,
            json!({"ok": true}),
        ))
    }

    #[test]
    fn test_success_advances_to_next_stage() {
        let pipeline = running("init", "t1");
        let result = transition(&pipeline, &success(&pipeline, "init", "t1"), &app_catalog());
        match result {
            Transition::Advance { next } => assert_eq!(next.name, "build"),
            other => panic!("unexpected transition {other:?}"),
        }
    }

    #[test]
    fn test_last_stage_completes() {
        let pipeline = running("test", "t3");
        let result = transition(&pipeline, &success(&pipeline, "test", "t3"), &app_catalog());
        assert_eq!(result, Transition::Complete);
    }

    #[test]
    fn test_evaluating_pipeline_is_reevaluated() {
        let mut pipeline = running("init", "t1");
        pipeline.status = PipelineStatus::Evaluating;
        let result = transition(&pipeline, &success(&pipeline, "init", "t1"), &app_catalog());
        assert_eq!(result.name(), "advance");
    }

    #[test]
    fn test_failure_preserves_worker_error() {
        let pipeline = running("build", "t2");
        let event = PipelineEvent::StageComplete(StageCompleteEvent::failed(
            pipeline.id.clone(),
            "build",
            "t2",
            ResultError::new("COMPILE_ERROR", "exit 101"),
        ));
        match transition(&pipeline, &event, &app_catalog()) {
            Transition::Fail(error) => {
                assert_eq!(error.kind, PipelineErrorKind::WorkerFailure);
                assert_eq!(error.code, "COMPILE_ERROR");
                assert_eq!(error.message, "exit 101");
                assert_eq!(error.stage.as_deref(), Some("build"));
            }
            other => panic!("unexpected transition {other:?}"),
        }
    }

    #[test]
    fn test_stale_stage_ignored() {
        let pipeline = running("build", "t2");
        let result = transition(&pipeline, &success(&pipeline, "init", "t2"), &app_catalog());
        assert!(matches!(result, Transition::Ignore(IgnoreReason::StageMismatch { .. })));
    }

    #[test]
    fn test_superseded_task_ignored() {
        let pipeline = running("build", "t-new");
        let result = transition(&pipeline, &success(&pipeline, "build", "t-old"), &app_catalog());
        assert!(matches!(result, Transition::Ignore(IgnoreReason::SupersededTask { .. })));
    }

    #[test]
    fn test_terminal_ignores_everything() {
        let mut pipeline = running("build", "t2");
        pipeline.status = PipelineStatus::Cancelled;
        let result = transition(&pipeline, &success(&pipeline, "build", "t2"), &app_catalog());
        assert_eq!(
            result,
            Transition::Ignore(IgnoreReason::Terminal {
                status: PipelineStatus::Cancelled
            })
        );

        let cancel = PipelineEvent::Cancel {
            pipeline_id: pipeline.id.clone(),
            reason: "again".into(),
        };
        assert_eq!(transition(&pipeline, &cancel, &app_catalog()).name(), "ignore");
    }

    #[test]
    fn test_initiated_pipeline_ignores_results() {
        let mut pipeline = running("init", "t1");
        pipeline.status = PipelineStatus::Initiated;
        let result = transition(&pipeline, &success(&pipeline, "init", "t1"), &app_catalog());
        assert!(matches!(result, Transition::Ignore(IgnoreReason::NotRunning { .. })));
    }

    #[test]
    fn test_timeout_for_current_task_fails() {
        let pipeline = running("test", "t3");
        let event = PipelineEvent::StageTimedOut {
            pipeline_id: pipeline.id.clone(),
            stage: "test".into(),
            task_id: "t3".into(),
            timeout_ms: 500,
        };
        match transition(&pipeline, &event, &app_catalog()) {
            Transition::Fail(error) => assert_eq!(error.code, PipelineError::TIMEOUT_CODE),
            other => panic!("unexpected transition {other:?}"),
        }
    }

    #[test]
    fn test_timeout_for_old_task_ignored() {
        let pipeline = running("test", "t3");
        let event = PipelineEvent::StageTimedOut {
            pipeline_id: pipeline.id.clone(),
            stage: "build".into(),
            task_id: "t2".into(),
            timeout_ms: 500,
        };
        assert_eq!(
            transition(&pipeline, &event, &app_catalog()),
            Transition::Ignore(IgnoreReason::StaleTimeout)
        );
    }

    #[test]
    fn test_cancel_running_pipeline() {
        let pipeline = running("build", "t2");
        let event = PipelineEvent::Cancel {
            pipeline_id: pipeline.id.clone(),
            reason: "user request".into(),
        };
        assert_eq!(
            transition(&pipeline, &event, &app_catalog()),
            Transition::Cancel {
                reason: "user request".into()
            }
        );
    }

    #[test]
    fn test_unknown_pipeline_type() {
        let mut pipeline = running("init", "t1");
        pipeline.pipeline_type = "library".into();
        let result = transition(&pipeline, &success(&pipeline, "init", "t1"), &app_catalog());
        assert!(matches!(result, Transition::Ignore(IgnoreReason::UnknownStage { .. })));
    }
}
