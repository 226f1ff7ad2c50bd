//! Pipeline status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a pipeline.
///
/// `Running` means the orchestrator is waiting for the current stage's worker.
/// `Evaluating` is transient: a stage completed and the next step is being
/// computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, no task dispatched yet.
    Initiated,
    /// A task is in flight.
    Running,
    /// A stage completed, the next step is being computed.
    Evaluating,
    /// All stages completed.
    Completed,
    /// A worker failed or a stage timed out.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Initiated
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiated => write!(f, "initiated"),
            Self::Running => write!(f, "running"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelineStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_status_display() {
        assert_eq!(PipelineStatus::Initiated.to_string(), "initiated");
        assert_eq!(PipelineStatus::Evaluating.to_string(), "evaluating");
        assert_eq!(PipelineStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_pipeline_status_is_terminal() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
        assert!(!PipelineStatus::Initiated.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
        assert!(!PipelineStatus::Evaluating.is_terminal());
    }

    #[test]
    fn test_pipeline_status_serialize() {
        let json = serde_json::to_string(&PipelineStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);

        let deserialized: PipelineStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(deserialized, PipelineStatus::Failed);
    }
}
