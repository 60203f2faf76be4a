//! Time utility functions

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time as unix nanoseconds.
pub fn now_nanos() -> i64 {
    // out of range only past the year 2262
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Unix nanoseconds to an RFC 3339 string with nanosecond precision.
///
/// Fixed precision keeps the strings lexicographically ordered, which the
/// trace-id discovery phase relies on when tracking the minimum `_time`.
pub fn nanos_to_rfc3339(nanos: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(nanos).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 timestamp into unix nanoseconds.
pub fn rfc3339_to_nanos(ts: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .and_then(|dt| dt.timestamp_nanos_opt())
}
