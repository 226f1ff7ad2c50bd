//! Trace context propagated from the triggering event into each task.

use serde::{Deserialize, Serialize};

use crate::utils::{generate_span_id, generate_trace_id, is_hex_id};

/// W3C style trace identifiers carried on every task envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    /// 32 hex character trace id shared by the whole pipeline run.
    pub trace_id: String,
    /// 16 hex character id of this span.
    pub span_id: String,
    /// Span that caused this one, absent for a root span.
    #[serde(default)]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Starts a new trace with a root span.
    #[must_use]
    pub fn root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
        }
    }

    /// Creates a child span in the same trace.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// Child of `parent` when present, otherwise a new root.
    #[must_use]
    pub fn child_or_root(parent: Option<&Self>) -> Self {
        parent.map_or_else(Self::root, Self::child)
    }

    /// Returns true if this is a root span.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Returns the name of the first malformed field, if any.
    #[must_use]
    pub fn malformed_field(&self) -> Option<&'static str> {
        if !is_hex_id(&self.trace_id, 32) {
            return Some("trace.trace_id");
        }
        if !is_hex_id(&self.span_id, 16) {
            return Some("trace.span_id");
        }
        match self.parent_span_id {
            Some(ref parent) if !is_hex_id(parent, 16) => Some("trace.parent_span_id"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_trace() {
        let trace = TraceContext::root();
        assert!(trace.is_root());
        assert!(trace.malformed_field().is_none());
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let root = TraceContext::root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn test_child_or_root() {
        assert!(TraceContext::child_or_root(None).is_root());
        let parent = TraceContext::root();
        assert!(!TraceContext::child_or_root(Some(&parent)).is_root());
    }

    #[test]
    fn test_malformed_trace() {
        let trace = TraceContext {
            trace_id: "not-hex".into(),
            span_id: generate_span_id(),
            parent_span_id: None,
        };
        assert_eq!(trace.malformed_field(), Some("trace.trace_id"));
    }
}
