//! Structured logging setup and span helpers.
//!
//! Every state change and every dropped message is logged through `tracing`
//! with `pipeline_id`, `stage`, `task_id` and stream fields. This module wires
//! a subscriber for binaries and tests that want one.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::contracts::TraceContext;
use crate::errors::ConductorError;

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Single line, human readable.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConductorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConductorError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<(), ConductorError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .try_init(),
    };
    result.map_err(|err| ConductorError::Config(format!("tracing already initialised: {err}")))
}

/// Span covering work done for one task, carrying its trace identifiers.
#[must_use]
pub fn task_span(pipeline_id: &str, stage: &str, task_id: &str, trace: &TraceContext) -> tracing::Span {
    tracing::info_span!(
        "task",
        pipeline_id,
        stage,
        task_id,
        trace_id = %trace.trace_id,
        span_id = %trace.span_id,
        parent_span_id = trace.parent_span_id.as_deref().unwrap_or(""),
    )
}
