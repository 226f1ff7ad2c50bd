//! Runtime shapes of a stream payload.
//!
//! Transports do not agree on what a stored entry looks like: some return the
//! JSON text that was written, some return raw bytes, and some hand back an
//! already decoded structure. Decoding inspects the shape first and only
//! parses text and bytes.

use thiserror::Error;

/// A stream payload as the transport returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// JSON text.
    Text(String),
    /// JSON bytes, expected to be UTF-8.
    Bytes(Vec<u8>),
    /// Already decoded value; used as is.
    Structured(serde_json::Value),
}

/// Why a payload could not be decoded.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Bytes were not UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Text was not JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Nothing to decode.
    #[error("payload is empty")]
    Empty,
}

impl RawPayload {
    /// Shape name for logs.
    #[must_use]
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Structured(_) => "structured",
        }
    }

    /// Decodes into a JSON value.
    pub fn decode(&self) -> Result<serde_json::Value, PayloadError> {
        match self {
            Self::Structured(value) => Ok(value.clone()),
            Self::Text(text) => parse_text(text),
            Self::Bytes(bytes) => parse_text(std::str::from_utf8(bytes)?),
        }
    }

    /// Best-effort text rendering for logs and dead letters.
    #[must_use]
    pub fn to_lossy_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

fn parse_text(text: &str) -> Result<serde_json::Value, PayloadError> {
    if text.trim().is_empty() {
        return Err(PayloadError::Empty);
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_is_not_reparsed() {
        // A structured string must stay a string, not be parsed as JSON text.
        let payload = RawPayload::Structured(json!("{\"a\":1}"));
        assert_eq!(payload.decode().unwrap(), json!("{\"a\":1}"));

        let payload = RawPayload::Structured(json!({"task_id": "t1"}));
        assert_eq!(payload.decode().unwrap()["task_id"], "t1");
    }

    #[test]
    fn test_text_and_bytes_are_parsed() {
        let text = RawPayload::Text(r#"{"a":1}"#.into());
        assert_eq!(text.decode().unwrap(), json!({"a": 1}));

        let bytes = RawPayload::Bytes(br#"{"b":2}"#.to_vec());
        assert_eq!(bytes.decode().unwrap(), json!({"b": 2}));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            RawPayload::Text("{not json".into()).decode(),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            RawPayload::Bytes(vec![0xff, 0xfe]).decode(),
            Err(PayloadError::Utf8(_))
        ));
        assert!(matches!(
            RawPayload::Text("  ".into()).decode(),
            Err(PayloadError::Empty)
        ));
    }

    #[test]
    fn test_lossy_text() {
        assert_eq!(RawPayload::Bytes(vec![b'o', b'k']).to_lossy_text(), "ok");
        assert_eq!(RawPayload::Structured(json!({"a": 1})).to_lossy_text(), r#"{"a":1}"#);
    }
}
