//! Canonical schema validation shared by both envelope kinds.
//!
//! Every envelope is validated twice: structurally by serde (unknown fields and
//! wrong types are rejected) and semantically by [`Envelope::validate`]. Both
//! the producer and the consumer run the same checks.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::OnceLock;

use crate::errors::{ContractViolation, EnvelopeKind};

/// The single schema version accepted on the wire.
///
/// Exactly one version is live at a time; any other value is rejected.
pub const SCHEMA_VERSION: &str = "1.0.0";

fn identifier_regex() -> &'static Regex {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Returns true if `value` is a valid worker type or stage name.
///
/// Identifiers become topic suffixes (`tasks.<worker_type>`), so they are
/// restricted to lowercase ASCII, digits, `_`, `.` and `-`.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    identifier_regex().is_match(value)
}

/// Schema-checked message exchanged over the bus.
pub trait Envelope: Serialize + DeserializeOwned + Sized {
    /// Which envelope this is, for error reporting.
    const KIND: EnvelopeKind;

    /// Semantic checks beyond what serde enforces.
    fn validate(&self) -> Result<(), ContractViolation>;

    /// Parses and validates a JSON value.
    fn from_json(value: &serde_json::Value) -> Result<Self, ContractViolation> {
        let envelope: Self = serde_json::from_value(value.clone())
            .map_err(|err| ContractViolation::new(Self::KIND, "<root>", err.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Parses and validates JSON text.
    fn from_json_str(text: &str) -> Result<Self, ContractViolation> {
        let envelope: Self = serde_json::from_str(text)
            .map_err(|err| ContractViolation::new(Self::KIND, "<root>", err.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validates, then serializes to a JSON value.
    ///
    /// An envelope that fails validation is never serialized.
    fn to_json(&self) -> Result<serde_json::Value, ContractViolation> {
        self.validate()?;
        serde_json::to_value(self)
            .map_err(|err| ContractViolation::new(Self::KIND, "<root>", err.to_string()))
    }
}

pub(crate) fn require_non_empty(
    kind: EnvelopeKind,
    field: &str,
    value: &str,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::new(kind, field, "must not be empty"));
    }
    Ok(())
}

pub(crate) fn require_identifier(
    kind: EnvelopeKind,
    field: &str,
    value: &str,
) -> Result<(), ContractViolation> {
    if !is_valid_identifier(value) {
        return Err(ContractViolation::new(
            kind,
            field,
            format!("'{value}' must match ^[a-z0-9][a-z0-9_.-]*$"),
        ));
    }
    Ok(())
}

pub(crate) fn require_schema_version(
    kind: EnvelopeKind,
    field: &str,
    value: &str,
) -> Result<(), ContractViolation> {
    if value != SCHEMA_VERSION {
        return Err(ContractViolation::new(
            kind,
            field,
            format!("'{value}' is not the live schema version {SCHEMA_VERSION}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("codegen"));
        assert!(is_valid_identifier("test-runner.v2"));
        assert!(is_valid_identifier("stage_1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("CodeGen"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("-leading"));
    }

    #[test]
    fn test_schema_version_pinned() {
        assert!(require_schema_version(EnvelopeKind::Task, "v", SCHEMA_VERSION).is_ok());
        let err = require_schema_version(EnvelopeKind::Task, "metadata.schema_version", "0.9.0")
            .unwrap_err();
        assert_eq!(err.field, "metadata.schema_version");
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty(EnvelopeKind::Result, "task_id", "  ").is_err());
        assert!(require_non_empty(EnvelopeKind::Result, "task_id", "t").is_ok());
    }
}
