//! Timestamp helpers
//!
//! Wire formats carry float Unix seconds; internally every timestamp is an
//! `i64` count of Unix nanoseconds so that window arithmetic stays exact.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};

use crate::errors::TypeError;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Convert float Unix seconds into Unix nanoseconds.
///
/// Rejects non-finite, negative and out-of-range values.
pub fn secs_to_nanos(secs: f64) -> Result<i64, TypeError> {
    let nanos = secs * NANOS_PER_SEC as f64;
    if !nanos.is_finite() || nanos < 0.0 || nanos >= i64::MAX as f64 {
        return Err(TypeError::InvalidTimestamp {
            value: secs.to_string(),
        });
    }
    Ok(nanos.round() as i64)
}

/// Convert Unix nanoseconds into float Unix seconds.
pub fn nanos_to_secs(nanos: i64) -> f64 {
    nanos as f64 / NANOS_PER_SEC as f64
}

/// Length of a `Duration` in nanoseconds, saturating at `i64::MAX`.
pub fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_nanos)
        .unwrap_or(0)
}

/// Format Unix nanoseconds as `YYYY-MM-DD HH:MM:SS.ffffff` in UTC.
pub fn format_utc(nanos: i64) -> String {
    Utc.timestamp_nanos(nanos)
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}
