//! Identifier and timestamp helpers shared across the crate.

mod ids;
pub mod timestamps;

pub use ids::{generate_id, generate_span_id, generate_trace_id, is_hex_id};
pub use timestamps::{elapsed_ms_since, now_utc, Timestamp};
