//! Identifier generation.

use rand::Rng;
use uuid::Uuid;

/// Generates a new time-ordered identifier (UUID v7).
///
/// Used for pipeline ids, task ids and message ids. Time ordering keeps
/// stream and log output readable without affecting uniqueness.
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a 128-bit trace id as 32 lowercase hex characters.
#[must_use]
pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a 64-bit span id as 16 lowercase hex characters.
#[must_use]
pub fn generate_span_id() -> String {
    // All-zero span ids are invalid in W3C trace context.
    let value: u64 = rand::thread_rng().gen_range(1..=u64::MAX);
    format!("{value:016x}")
}

/// Returns true if `value` is exactly `len` lowercase hex characters.
#[must_use]
pub fn is_hex_id(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
