//! The pipeline record and its append-only stage outputs.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use super::PipelineStatus;
use crate::errors::PipelineError;
use crate::utils::{generate_id, now_utc, Timestamp};

/// Ordered, append-only mapping of stage name to the worker's result payload.
///
/// Keys keep completion order and a key, once written, never changes value.
/// Serializes as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutputs {
    entries: Vec<(String, serde_json::Value)>,
}

impl StageOutputs {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an output for `stage`.
    ///
    /// Returns false and leaves the mapping untouched if the stage already has
    /// an output.
    pub fn insert(&mut self, stage: impl Into<String>, output: serde_json::Value) -> bool {
        let stage = stage.into();
        if self.contains(&stage) {
            return false;
        }
        self.entries.push((stage, output));
        true
    }

    /// Returns the output recorded for `stage`.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, value)| value)
    }

    /// Returns true if `stage` has an output.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == stage)
    }

    /// Stage names in completion order.
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Iterates entries in completion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of completed stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no stage has completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the outputs as a JSON object.
    ///
    /// `serde_json::Map` does not keep insertion order, so readers that need
    /// order should use [`StageOutputs::stages`].
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.entries.iter().cloned().collect())
    }
}

impl Serialize for StageOutputs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (stage, value) in &self.entries {
            map.serialize_entry(stage, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageOutputs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OutputsVisitor;

        impl<'de> Visitor<'de> for OutputsVisitor {
            type Value = StageOutputs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of stage name to output")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut outputs = StageOutputs::new();
                while let Some((stage, value)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    if !outputs.insert(stage.clone(), value) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate stage output '{stage}'"
                        )));
                    }
                }
                Ok(outputs)
            }
        }

        deserializer.deserialize_map(OutputsVisitor)
    }
}

/// Request to create a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPipeline {
    /// Pipeline type; selects the stage list from the catalog.
    pub pipeline_type: String,
    /// Human readable name.
    pub name: String,
    /// Free-form metadata forwarded to the first stage's payload.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewPipeline {
    /// Creates a new request.
    #[must_use]
    pub fn new(pipeline_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pipeline_type: pipeline_type.into(),
            name: name.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One build request progressing through ordered stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Opaque identifier.
    pub id: String,
    /// Pipeline type.
    #[serde(rename = "type")]
    pub pipeline_type: String,
    /// Human readable name.
    pub name: String,
    /// Lifecycle status.
    pub status: PipelineStatus,
    /// Stage currently executing, or last executed when terminal.
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Task id of the in-flight dispatch.
    #[serde(default)]
    pub current_task_id: Option<String>,
    /// Explicit retries of the current stage.
    #[serde(default)]
    pub retry_count: u32,
    /// Completed stage outputs, in completion order.
    #[serde(default)]
    pub stage_outputs: StageOutputs,
    /// Derived completion percentage.
    #[serde(default)]
    pub progress: f64,
    /// Failure or cancellation cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    /// Free-form creation metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

impl Pipeline {
    /// Builds a fresh record in `initiated` status with a new id.
    #[must_use]
    pub fn from_request(request: &NewPipeline) -> Self {
        let now = now_utc();
        Self {
            id: generate_id(),
            pipeline_type: request.pipeline_type.clone(),
            name: request.name.clone(),
            status: PipelineStatus::Initiated,
            current_stage: None,
            current_task_id: None,
            retry_count: 0,
            stage_outputs: StageOutputs::new(),
            progress: 0.0,
            error: None,
            metadata: request.metadata.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the pipeline reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
