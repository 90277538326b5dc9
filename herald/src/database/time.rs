//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC) so that
//! staleness, backoff and dedup windows can be compared directly in SQL.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `Duration` to milliseconds, saturating at `i64::MAX`.
#[inline]
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// The instant `window` before `now_ms`, used as a lower bound in range queries.
#[inline]
pub fn cutoff_ms(now_ms: i64, window: Duration) -> i64 {
    now_ms.saturating_sub(duration_ms(window))
}

/// Time left until `target_ms`, or zero if it has already passed.
pub fn until_ms(target_ms: i64) -> Duration {
    let remaining = target_ms.saturating_sub(now_ms());
    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Out-of-range values clamp to the nearest representable timestamp.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None if ms.is_negative() => DateTime::<Utc>::MIN_UTC,
        chrono::LocalResult::None => DateTime::<Utc>::MAX_UTC,
    }
}
