//! Timestamp utilities.

use chrono::{DateTime, Utc};

/// Timestamp type used on records and envelopes.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Milliseconds elapsed between `start` and now, clamped at zero.
///
/// Clock skew between hosts can put `start` in the future; that reads as 0.
#[must_use]
pub fn elapsed_ms_since(start: Timestamp) -> u64 {
    let elapsed = Utc::now().signed_duration_since(start).num_milliseconds();
    u64::try_from(elapsed).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_elapsed_ms_since_past() {
        let start = Utc::now() - Duration::milliseconds(1500);
        let elapsed = elapsed_ms_since(start);
        assert!(elapsed >= 1500);
    }

    #[test]
    fn test_elapsed_ms_since_future_is_zero() {
        let start = Utc::now() + Duration::seconds(60);
        assert_eq!(elapsed_ms_since(start), 0);
    }
}
