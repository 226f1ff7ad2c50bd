//! Ordered stage lists per pipeline type.
//!
//! The next stage is a pure function of the pipeline type and the current
//! stage; nothing about stage order is stored on the pipeline record.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::contracts::{is_valid_identifier, Priority, TaskConstraints};
use crate::errors::ConductorError;

/// One stage of a pipeline type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage name, unique within the pipeline type.
    pub name: String,
    /// Worker type that executes the stage.
    pub worker_type: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Stage window; the configured default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Explicit retries allowed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Minimum confidence required from the worker.
    #[serde(default)]
    pub required_confidence: f64,
    /// Static payload merged into every task for this stage.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_max_retries() -> u32 {
    3
}

impl StageDefinition {
    /// Stage with default constraints.
    #[must_use]
    pub fn new(name: impl Into<String>, worker_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_type: worker_type.into(),
            priority: Priority::default(),
            timeout_ms: None,
            max_retries: default_max_retries(),
            required_confidence: 0.0,
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the stage window.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the confidence floor.
    #[must_use]
    pub fn with_required_confidence(mut self, confidence: f64) -> Self {
        self.required_confidence = confidence;
        self
    }

    /// Sets the static payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Effective window given the configured default.
    #[must_use]
    pub fn effective_timeout_ms(&self, default_timeout_ms: u64) -> u64 {
        self.timeout_ms.unwrap_or(default_timeout_ms)
    }

    /// Task constraints for this stage.
    #[must_use]
    pub fn constraints(&self, default_timeout_ms: u64) -> TaskConstraints {
        TaskConstraints {
            timeout_ms: self.effective_timeout_ms(default_timeout_ms),
            max_retries: self.max_retries,
            required_confidence: self.required_confidence,
        }
    }
}

/// Registry of pipeline types and their ordered stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCatalog {
    pipelines: HashMap<String, Vec<StageDefinition>>,
}

impl StageCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pipeline type, builder style.
    pub fn with_pipeline(
        mut self,
        pipeline_type: impl Into<String>,
        stages: Vec<StageDefinition>,
    ) -> Result<Self, ConductorError> {
        self.register(pipeline_type, stages)?;
        Ok(self)
    }

    /// Adds or replaces a pipeline type after validating its stages.
    pub fn register(
        &mut self,
        pipeline_type: impl Into<String>,
        stages: Vec<StageDefinition>,
    ) -> Result<(), ConductorError> {
        let pipeline_type = pipeline_type.into();
        validate_stages(&pipeline_type, &stages)?;
        self.pipelines.insert(pipeline_type, stages);
        Ok(())
    }

    /// Loads a catalog from JSON (`{"<type>": [stage, ...]}`) and validates it.
    pub fn from_json_str(text: &str) -> Result<Self, ConductorError> {
        let raw: HashMap<String, Vec<StageDefinition>> = serde_json::from_str(text)?;
        let mut catalog = Self::new();
        for (pipeline_type, stages) in raw {
            catalog.register(pipeline_type, stages)?;
        }
        Ok(catalog)
    }

    /// Returns true if the pipeline type is known.
    #[must_use]
    pub fn contains(&self, pipeline_type: &str) -> bool {
        self.pipelines.contains_key(pipeline_type)
    }

    /// Ordered stages of a pipeline type.
    #[must_use]
    pub fn stages(&self, pipeline_type: &str) -> Option<&[StageDefinition]> {
        self.pipelines.get(pipeline_type).map(Vec::as_slice)
    }

    /// First stage of a pipeline type.
    #[must_use]
    pub fn first_stage(&self, pipeline_type: &str) -> Option<&StageDefinition> {
        self.stages(pipeline_type)?.first()
    }

    /// Stage definition by name.
    #[must_use]
    pub fn stage(&self, pipeline_type: &str, name: &str) -> Option<&StageDefinition> {
        self.stages(pipeline_type)?.iter().find(|stage| stage.name == name)
    }

    /// Stage after `current`; `None` when `current` is last or unknown.
    #[must_use]
    pub fn next_stage(&self, pipeline_type: &str, current: &str) -> Option<&StageDefinition> {
        let stages = self.stages(pipeline_type)?;
        let index = stages.iter().position(|stage| stage.name == current)?;
        stages.get(index + 1)
    }

    /// Percentage of stages done when `completed` stages have outputs.
    #[must_use]
    pub fn progress(&self, pipeline_type: &str, completed: usize) -> f64 {
        let total = self.stages(pipeline_type).map_or(0, <[StageDefinition]>::len);
        if total == 0 {
            return 0.0;
        }
        let completed = u32::try_from(completed.min(total)).unwrap_or(u32::MAX);
        let total = u32::try_from(total).unwrap_or(u32::MAX);
        (f64::from(completed) * 100.0 / f64::from(total) * 100.0).round() / 100.0
    }
}

fn validate_stages(pipeline_type: &str, stages: &[StageDefinition]) -> Result<(), ConductorError> {
    let invalid = |message: String| ConductorError::Config(format!("pipeline '{pipeline_type}': {message}"));

    if pipeline_type.trim().is_empty() {
        return Err(ConductorError::Config("pipeline type must not be empty".into()));
    }
    if stages.is_empty() {
        return Err(invalid("has no stages".into()));
    }
    let mut seen = HashSet::new();
    for stage in stages {
        if !is_valid_identifier(&stage.name) {
            return Err(invalid(format!("stage name '{}' is not a valid identifier", stage.name)));
        }
        if !is_valid_identifier(&stage.worker_type) {
            return Err(invalid(format!(
                "worker type '{}' of stage '{}' is not a valid identifier",
                stage.worker_type, stage.name
            )));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(invalid(format!("stage '{}' appears twice", stage.name)));
        }
        if stage.timeout_ms == Some(0) {
            return Err(invalid(format!("stage '{}' has a zero timeout", stage.name)));
        }
        if !(0.0..=1.0).contains(&stage.required_confidence) {
            return Err(invalid(format!(
                "stage '{}' requires confidence outside [0, 1]",
                stage.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn app() -> StageCatalog {
        StageCatalog::new()
            .with_pipeline(
                "app",
                vec![
                    StageDefinition::new("init", "scaffold"),
                    StageDefinition::new("build", "compiler").with_timeout_ms(60_000),
                    StageDefinition::new("test", "tester"),
                ],
            )
            .unwrap()
    }

    #[test]
    fn test_stage_order() {
        let catalog = app();
        assert_eq!(catalog.first_stage("app").unwrap().name, "init");
        assert_eq!(catalog.next_stage("app", "init").unwrap().name, "build");
        assert_eq!(catalog.next_stage("app", "build").unwrap().name, "test");
        assert!(catalog.next_stage("app", "test").is_none());
        assert!(catalog.next_stage("app", "deploy").is_none());
        assert!(catalog.first_stage("lib").is_none());
    }

    #[test]
    fn test_progress() {
        let catalog = app();
        assert_eq!(catalog.progress("app", 0), 0.0);
        assert_eq!(catalog.progress("app", 1), 33.33);
        assert_eq!(catalog.progress("app", 3), 100.0);
        assert_eq!(catalog.progress("app", 7), 100.0);
        assert_eq!(catalog.progress("unknown", 1), 0.0);
    }

    #[test]
    fn test_constraints_use_default_timeout() {
        let catalog = app();
        assert_eq!(catalog.stage("app", "init").unwrap().constraints(1_000).timeout_ms, 1_000);
        assert_eq!(catalog.stage("app", "build").unwrap().constraints(1_000).timeout_ms, 60_000);
    }

    #[test]
    fn test_rejects_duplicate_stage() {
        let result = StageCatalog::new().with_pipeline(
            "app",
            vec![StageDefinition::new("init", "a"), StageDefinition::new("init", "b")],
        );
        assert!(matches!(result, Err(ConductorError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_and_bad_names() {
        assert!(StageCatalog::new().with_pipeline("app", vec![]).is_err());
        assert!(StageCatalog::new()
            .with_pipeline("app", vec![StageDefinition::new("Init", "scaffold")])
            .is_err());
        assert!(StageCatalog::new()
            .with_pipeline("app", vec![StageDefinition::new("init", "scaffold worker")])
            .is_err());
    }

    #[test]
    fn test_from_json() {
        let catalog = StageCatalog::from_json_str(
            r#"{"app": [
                {"name": "init", "worker_type": "scaffold"},
                {"name": "build", "worker_type": "compiler", "priority": "high", "timeout_ms": 5000}
            ]}"#,
        )
        .unwrap();
        let build = catalog.stage("app", "build").unwrap();
        assert_eq!(build.priority, Priority::High);
        assert_eq!(build.max_retries, 3);
    }
}
