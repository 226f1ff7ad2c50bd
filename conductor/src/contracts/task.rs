//! Task envelope: one unit of work sent to a worker.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::schema::{require_identifier, require_non_empty, require_schema_version};
use super::{Envelope, TraceContext, SCHEMA_VERSION};
use crate::core::StageOutputs;
use crate::errors::{ContractViolation, EnvelopeKind};
use crate::utils::{now_utc, Timestamp};

/// Scheduling priority hint for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Normal work.
    #[default]
    Medium,
    /// Ahead of normal work.
    High,
    /// Ahead of everything.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Execution limits for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConstraints {
    /// Time the worker has to answer.
    pub timeout_ms: u64,
    /// Explicit retries allowed for this stage.
    pub max_retries: u32,
    /// Minimum confidence the worker must report, in `[0, 1]`.
    pub required_confidence: f64,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_retries: 3,
            required_confidence: 0.0,
        }
    }
}

/// Envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskMetadata {
    /// When the envelope was built.
    pub created_at: Timestamp,
    /// Must equal [`SCHEMA_VERSION`].
    pub schema_version: String,
}

impl TaskMetadata {
    /// Metadata stamped now with the live schema version.
    #[must_use]
    pub fn now() -> Self {
        Self {
            created_at: now_utc(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

/// Pipeline state a worker may read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineContext {
    /// Pipeline type.
    pub pipeline_type: String,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Stage this task executes.
    pub current_stage: String,
    /// Outputs of every stage completed so far.
    #[serde(default)]
    pub stage_outputs: StageOutputs,
}

/// One dispatched unit of work.
///
/// Built by the dispatcher, never mutated after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEnvelope {
    /// Unique per envelope; producer-side idempotency key.
    pub message_id: String,
    /// Unit of work id; echoed back on the result.
    pub task_id: String,
    /// Owning pipeline.
    pub pipeline_id: String,
    /// Worker category, also the topic suffix.
    pub worker_type: String,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Execution limits.
    pub constraints: TaskConstraints,
    /// Explicit retries already made for this stage.
    #[serde(default)]
    pub retry_count: u32,
    /// Worker specific input, opaque to the core.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Creation time and schema version.
    pub metadata: TaskMetadata,
    /// Trace context.
    pub trace: TraceContext,
    /// Pipeline state visible to the worker.
    pub pipeline_context: PipelineContext,
}

impl TaskEnvelope {
    /// Topic this envelope is published on.
    #[must_use]
    pub fn topic(&self, prefix: &str) -> String {
        task_topic(prefix, &self.worker_type)
    }

    /// Stage this task executes.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.pipeline_context.current_stage
    }
}

/// Topic name for a worker type, e.g. `tasks.codegen`.
#[must_use]
pub fn task_topic(prefix: &str, worker_type: &str) -> String {
    format!("{prefix}.{worker_type}")
}

impl Envelope for TaskEnvelope {
    const KIND: EnvelopeKind = EnvelopeKind::Task;

    fn validate(&self) -> Result<(), ContractViolation> {
        let kind = Self::KIND;
        require_non_empty(kind, "message_id", &self.message_id)?;
        require_non_empty(kind, "task_id", &self.task_id)?;
        require_non_empty(kind, "pipeline_id", &self.pipeline_id)?;
        require_identifier(kind, "worker_type", &self.worker_type)?;

        if self.constraints.timeout_ms == 0 {
            return Err(ContractViolation::task(
                "constraints.timeout_ms",
                "must be greater than zero",
            ));
        }
        let confidence = self.constraints.required_confidence;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(ContractViolation::task(
                "constraints.required_confidence",
                format!("{confidence} is outside [0, 1]"),
            ));
        }
        if self.retry_count > self.constraints.max_retries {
            return Err(ContractViolation::task(
                "retry_count",
                format!(
                    "{} exceeds constraints.max_retries {}",
                    self.retry_count, self.constraints.max_retries
                ),
            ));
        }

        require_schema_version(kind, "metadata.schema_version", &self.metadata.schema_version)?;

        if let Some(field) = self.trace.malformed_field() {
            return Err(ContractViolation::task(field, "must be lowercase hex of the W3C length"));
        }

        require_non_empty(kind, "pipeline_context.pipeline_type", &self.pipeline_context.pipeline_type)?;
        require_identifier(kind, "pipeline_context.current_stage", &self.pipeline_context.current_stage)?;
        if self.pipeline_context.stage_outputs.contains(&self.pipeline_context.current_stage) {
            return Err(ContractViolation::task(
                "pipeline_context.stage_outputs",
                "already holds an output for the stage being dispatched",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::task_envelope;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_valid_envelope_round_trips() {
        let envelope = task_envelope("p1", "build", "compiler");
        let value = envelope.to_json().unwrap();
        let back = TaskEnvelope::from_json(&value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_topic_name() {
        let envelope = task_envelope("p1", "build", "compiler");
        assert_eq!(envelope.topic("tasks"), "tasks.compiler");
        assert_eq!(envelope.stage(), "build");
    }

    #[test]
    fn test_rejects_wrong_schema_version() {
        let mut envelope = task_envelope("p1", "build", "compiler");
        envelope.metadata.schema_version = "2.0.0".into();
        let err = envelope.to_json().unwrap_err();
        assert_eq!(err.field, "metadata.schema_version");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut envelope = task_envelope("p1", "build", "compiler");
        envelope.constraints.timeout_ms = 0;
        assert_eq!(envelope.validate().unwrap_err().field, "constraints.timeout_ms");
    }

    #[test]
    fn test_rejects_confidence_out_of_range() {
        let mut envelope = task_envelope("p1", "build", "compiler");
        envelope.constraints.required_confidence = 1.5;
        assert!(envelope.validate().is_err());
        envelope.constraints.required_confidence = f64::NAN;
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn test_rejects_retry_beyond_limit() {
        let mut envelope = task_envelope("p1", "build", "compiler");
        envelope.constraints.max_retries = 1;
        envelope.retry_count = 2;
        assert_eq!(envelope.validate().unwrap_err().field, "retry_count");
    }

    #[test]
    fn test_rejects_bad_worker_type() {
        let mut envelope = task_envelope("p1", "build", "compiler");
        envelope.worker_type = "Compiler Worker".into();
        assert_eq!(envelope.validate().unwrap_err().field, "worker_type");
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let envelope = task_envelope("p1", "build", "compiler");
        let mut value = envelope.to_json().unwrap();
        value["surprise"] = json!(true);
        let err = TaskEnvelope::from_json(&value).unwrap_err();
        assert_eq!(err.field, "<root>");
        assert!(err.reason.contains("surprise"));
    }

    #[test]
    fn test_rejects_stage_already_completed() {
        let mut envelope = task_envelope("p1", "build", "compiler");
        envelope
            .pipeline_context
            .stage_outputs
            .insert("build", json!({}));
        assert_eq!(
            envelope.validate().unwrap_err().field,
            "pipeline_context.stage_outputs"
        );
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low < Priority::Medium);
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
