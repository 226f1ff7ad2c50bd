//! Result envelope: one per completed or failed unit of work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::schema::{require_identifier, require_non_empty, require_schema_version};
use super::{Envelope, TaskEnvelope, SCHEMA_VERSION};
use crate::errors::{ContractViolation, EnvelopeKind};
use crate::utils::{now_utc, Timestamp};

/// Terminal status reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The task succeeded.
    Success,
    /// The task failed.
    Failed,
    /// The worker gave up after the task's timeout.
    Timeout,
    /// The worker abandoned the task.
    Cancelled,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultError {
    /// Machine readable code.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Whether an explicit retry may succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl ResultError {
    /// Creates a non-retryable error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Sets the retryable flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Execution metrics reported by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultMetrics {
    /// Wall time spent on the task.
    pub duration_ms: u64,
    /// Optional named resource counters (tokens, cpu seconds, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, f64>,
}

impl ResultMetrics {
    /// Metrics with only a duration.
    #[must_use]
    pub fn with_duration(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            resources: BTreeMap::new(),
        }
    }

    /// Adds a resource counter.
    #[must_use]
    pub fn with_resource(mut self, name: impl Into<String>, value: f64) -> Self {
        self.resources.insert(name.into(), value);
        self
    }
}

/// The answer to exactly one task envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultEnvelope {
    /// Task this result answers.
    pub task_id: String,
    /// Owning pipeline; used to demultiplex the shared results topic.
    pub pipeline_id: String,
    /// Worker instance that produced the result.
    pub worker_id: String,
    /// Worker category.
    pub worker_type: String,
    /// True only together with `status == success` and no error.
    pub success: bool,
    /// Terminal status.
    pub status: ResultStatus,
    /// Opaque result payload.
    #[serde(default)]
    pub result: serde_json::Value,
    /// Execution metrics.
    #[serde(default)]
    pub metrics: ResultMetrics,
    /// Error, present exactly when `success` is false.
    #[serde(default)]
    pub error: Option<ResultError>,
    /// Non-fatal warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// When the worker finished.
    pub timestamp: Timestamp,
    /// Must equal [`SCHEMA_VERSION`].
    pub schema_version: String,
}

impl ResultEnvelope {
    /// Successful result answering `task`.
    #[must_use]
    pub fn success(task: &TaskEnvelope, worker_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            task_id: task.task_id.clone(),
            pipeline_id: task.pipeline_id.clone(),
            worker_id: worker_id.into(),
            worker_type: task.worker_type.clone(),
            success: true,
            status: ResultStatus::Success,
            result,
            metrics: ResultMetrics::default(),
            error: None,
            warnings: Vec::new(),
            timestamp: now_utc(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Failed result answering `task`.
    ///
    /// `status` should be one of the non-success statuses; passing
    /// [`ResultStatus::Success`] yields an envelope that fails validation.
    #[must_use]
    pub fn failure(
        task: &TaskEnvelope,
        worker_id: impl Into<String>,
        status: ResultStatus,
        error: ResultError,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            pipeline_id: task.pipeline_id.clone(),
            worker_id: worker_id.into(),
            worker_type: task.worker_type.clone(),
            success: false,
            status,
            result: serde_json::Value::Null,
            metrics: ResultMetrics::default(),
            error: Some(error),
            warnings: Vec::new(),
            timestamp: now_utc(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Sets the metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: ResultMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

impl Envelope for ResultEnvelope {
    const KIND: EnvelopeKind = EnvelopeKind::Result;

    fn validate(&self) -> Result<(), ContractViolation> {
        let kind = Self::KIND;
        require_non_empty(kind, "task_id", &self.task_id)?;
        require_non_empty(kind, "pipeline_id", &self.pipeline_id)?;
        require_non_empty(kind, "worker_id", &self.worker_id)?;
        require_identifier(kind, "worker_type", &self.worker_type)?;
        require_schema_version(kind, "schema_version", &self.schema_version)?;

        match (self.success, self.status, &self.error) {
            (true, ResultStatus::Success, None) => Ok(()),
            (true, ResultStatus::Success, Some(_)) => Err(ContractViolation::result(
                "error",
                "must be absent when success is true",
            )),
            (true, status, _) => Err(ContractViolation::result(
                "status",
                format!("is '{status}' but success is true"),
            )),
            (false, ResultStatus::Success, _) => Err(ContractViolation::result(
                "status",
                "is 'success' but success is false",
            )),
            (false, _, None) => Err(ContractViolation::result(
                "error",
                "is required when success is false",
            )),
            (false, _, Some(error)) => require_non_empty(kind, "error.code", &error.code),
        }
    }
}
