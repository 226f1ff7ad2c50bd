//! Error types for the conductor orchestration core.
//!
//! The taxonomy mirrors how failures are handled at runtime:
//!
//! - [`ContractViolation`]: an envelope failed schema validation. It is never
//!   published and never advances pipeline state.
//! - [`ConductorError::Transport`]: the bus or the key-value store is
//!   unreachable. Retried locally with backoff.
//! - [`ConductorError::WorkerFailure`] and [`ConductorError::Timeout`]: the only
//!   kinds that move a pipeline to `failed`.
//!
//! Duplicate events are not errors at all; the state machine reports them as an
//! ignored transition.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::bus::BusError;
use crate::kv::KvError;
use crate::repository::RepositoryError;

/// The main error type for conductor operations.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// An envelope failed validation against the canonical schema.
    #[error("{0}")]
    ContractViolation(#[from] ContractViolation),

    /// The message bus or key-value store could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A worker reported a failed result.
    #[error("Worker failure in stage '{stage}': {code}: {message}")]
    WorkerFailure {
        /// Stage the worker was executing.
        stage: String,
        /// Worker supplied error code.
        code: String,
        /// Worker supplied error message.
        message: String,
    },

    /// No result arrived within the stage window.
    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Stage that timed out.
        stage: String,
        /// Window that elapsed.
        timeout_ms: u64,
    },

    /// The pipeline repository failed.
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// A pipeline does not exist.
    #[error("Pipeline not found: {0}")]
    NotFound(String),

    /// An operation is not valid in the pipeline's current state.
    #[error("Invalid state for pipeline '{pipeline_id}': {message}")]
    InvalidState {
        /// Pipeline the operation targeted.
        pipeline_id: String,
        /// What was wrong.
        message: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The circuit breaker for a dependency is open.
    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),
}

impl ConductorError {
    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(pipeline_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            pipeline_id: pipeline_id.into(),
            message: message.into(),
        }
    }

    /// Returns true when retrying the operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Repository(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<BusError> for ConductorError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Contract(violation) => Self::ContractViolation(violation),
            BusError::Serialization(err) => Self::Serialization(err),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<KvError> for ConductorError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Serialization(err) => Self::Serialization(err),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Which envelope a contract violation was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A task envelope (orchestrator to worker).
    Task,
    /// A result envelope (worker to orchestrator).
    Result,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Result => write!(f, "result"),
        }
    }
}

/// An envelope failed validation against the canonical schema.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Contract violation in {envelope} envelope: field '{field}' {reason}")]
pub struct ContractViolation {
    /// Envelope kind.
    pub envelope: EnvelopeKind,
    /// Offending field, dotted path.
    pub field: String,
    /// Human readable reason.
    pub reason: String,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractViolation {
    /// Creates a new contract violation.
    #[must_use]
    pub fn new(envelope: EnvelopeKind, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            envelope,
            field: field.into(),
            reason: reason.into(),
            context: HashMap::new(),
        }
    }

    /// Violation inside a task envelope.
    #[must_use]
    pub fn task(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Task, field, reason)
    }

    /// Violation inside a result envelope.
    #[must_use]
    pub fn result(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Result, field, reason)
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Stable error code, e.g. `CONTRACT-RESULT-STATUS`.
    #[must_use]
    pub fn code(&self) -> String {
        let field = self
            .field
            .split('.')
            .next()
            .unwrap_or_default()
            .to_uppercase();
        format!("CONTRACT-{}-{}", self.envelope.to_string().to_uppercase(), field)
    }

    /// Converts to a dictionary representation for logs.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "envelope": self.envelope,
            "field": self.field,
            "reason": self.reason,
            "context": self.context,
        })
    }
}

/// The error kind recorded on a failed or cancelled pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    /// The worker returned `success = false`.
    WorkerFailure,
    /// The stage did not answer in time.
    Timeout,
    /// The pipeline was cancelled.
    Cancelled,
}

/// Error payload stored on a pipeline record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    /// Error kind.
    pub kind: PipelineErrorKind,
    /// Error code, worker supplied or synthetic.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Whether the worker marked the failure retryable.
    #[serde(default)]
    pub retryable: bool,
    /// Stage the failure happened in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl PipelineError {
    /// Synthetic code used when a stage window elapses.
    pub const TIMEOUT_CODE: &'static str = "STAGE_TIMEOUT";

    /// Code used for cancellations.
    pub const CANCELLED_CODE: &'static str = "PIPELINE_CANCELLED";

    /// Builds the synthetic timeout error.
    #[must_use]
    pub fn timeout(stage: impl Into<String>, timeout_ms: u64) -> Self {
        let stage = stage.into();
        Self {
            kind: PipelineErrorKind::Timeout,
            code: Self::TIMEOUT_CODE.to_string(),
            message: format!("No result for stage '{stage}' within {timeout_ms}ms"),
            retryable: true,
            stage: Some(stage),
        }
    }

    /// Builds a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>, stage: Option<String>) -> Self {
        Self {
            kind: PipelineErrorKind::Cancelled,
            code: Self::CANCELLED_CODE.to_string(),
            message: reason.into(),
            retryable: false,
            stage,
        }
    }

    /// Wraps a worker supplied error verbatim.
    #[must_use]
    pub fn worker(stage: impl Into<String>, error: &crate::contracts::ResultError) -> Self {
        Self {
            kind: PipelineErrorKind::WorkerFailure,
            code: error.code.clone(),
            message: error.message.clone(),
            retryable: error.retryable,
            stage: Some(stage.into()),
        }
    }
}

impl From<&PipelineError> for ConductorError {
    fn from(err: &PipelineError) -> Self {
        let stage = err.stage.clone().unwrap_or_default();
        match err.kind {
            PipelineErrorKind::Timeout => Self::Timeout {
                stage,
                timeout_ms: 0,
            },
            PipelineErrorKind::WorkerFailure | PipelineErrorKind::Cancelled => {
                Self::WorkerFailure {
                    stage,
                    code: err.code.clone(),
                    message: err.message.clone(),
                }
            }
        }
    }
}
