//! Fixture builders for envelopes and catalogs.

use serde_json::json;

use crate::catalog::{StageCatalog, StageDefinition};
use crate::contracts::{
    PipelineContext, Priority, TaskConstraints, TaskEnvelope, TaskMetadata, TraceContext,
};
use crate::core::StageOutputs;
use crate::utils::generate_id;

/// Pipeline type of [`app_catalog`].
pub const APP_PIPELINE: &str = "app";

/// Window of the `test` stage in [`app_catalog`].
pub const APP_TEST_TIMEOUT_MS: u64 = 60_000;

/// Catalog with one pipeline type, `app = [init, build, test]`.
///
/// `init` runs on `scaffold`, `build` on `compiler` (two explicit retries
/// allowed), `test` on `tester` with a one minute window.
#[must_use]
pub fn app_catalog() -> StageCatalog {
    let stages = vec![
        StageDefinition::new("init", "scaffold").with_payload(json!({"template": "web"})),
        StageDefinition::new("build", "compiler")
            .with_priority(Priority::High)
            .with_max_retries(2),
        StageDefinition::new("test", "tester").with_timeout_ms(APP_TEST_TIMEOUT_MS),
    ];
    let mut catalog = StageCatalog::new();
    if let Err(err) = catalog.register(APP_PIPELINE, stages) {
        panic!("app catalog is invalid: {err}");
    }
    catalog
}

/// A valid task envelope for `stage` of pipeline `pipeline_id`.
#[must_use]
pub fn task_envelope(pipeline_id: &str, stage: &str, worker_type: &str) -> TaskEnvelope {
    TaskEnvelope {
        message_id: generate_id(),
        task_id: generate_id(),
        pipeline_id: pipeline_id.to_string(),
        worker_type: worker_type.to_string(),
        priority: Priority::default(),
        constraints: TaskConstraints::default(),
        retry_count: 0,
        payload: json!({}),
        metadata: TaskMetadata::now(),
        trace: TraceContext::root(),
        pipeline_context: PipelineContext {
            pipeline_type: APP_PIPELINE.to_string(),
            pipeline_name: "demo".to_string(),
            current_stage: stage.to_string(),
            stage_outputs: StageOutputs::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Envelope;

    #[test]
    fn test_fixtures_are_valid() {
        assert!(task_envelope("p1", "init", "scaffold").validate().is_ok());

        let catalog = app_catalog();
        let names: Vec<_> = catalog
            .stages(APP_PIPELINE)
            .unwrap()
            .iter()
            .map(|stage| stage.name.as_str())
            .collect();
        assert_eq!(names, ["init", "build", "test"]);
    }
}
