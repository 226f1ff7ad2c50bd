//! Task records kept in the key-value store.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::contracts::{TaskEnvelope, TraceContext};
use crate::errors::ConductorError;
use crate::kv::{task_key, KeyValueStore};
use crate::utils::Timestamp;

/// What the dispatcher remembers about a published task.
///
/// Stored under `task:<task_id>` so a result can be mapped back to the stage
/// it answers even after the pipeline moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Owning pipeline.
    pub pipeline_id: String,
    /// Stage the task executes.
    pub stage: String,
    /// Worker type the task was routed to.
    pub worker_type: String,
    /// Trace of the task.
    pub trace: TraceContext,
    /// Explicit retry number of the task.
    #[serde(default)]
    pub retry_count: u32,
    /// Stage window the watchdog was armed with.
    #[serde(default)]
    pub timeout_ms: u64,
    /// When the task was built.
    pub dispatched_at: Timestamp,
}

impl TaskRecord {
    /// Record describing `envelope`.
    #[must_use]
    pub fn from_envelope(envelope: &TaskEnvelope) -> Self {
        Self {
            pipeline_id: envelope.pipeline_id.clone(),
            stage: envelope.stage().to_string(),
            worker_type: envelope.worker_type.clone(),
            trace: envelope.trace.clone(),
            retry_count: envelope.retry_count,
            timeout_ms: envelope.constraints.timeout_ms,
            dispatched_at: envelope.metadata.created_at,
        }
    }
}

/// Reads the record of a dispatched task.
///
/// An unreadable record is logged and treated as missing.
pub async fn load_task_record(
    store: &dyn KeyValueStore,
    task_id: &str,
) -> Result<Option<TaskRecord>, ConductorError> {
    let Some(value) = store.get(&task_key(task_id)).await? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            warn!(task_id, error = %err, "Ignoring unreadable task record");
            Ok(None)
        }
    }
}
