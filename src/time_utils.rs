// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date/time formatting and activity intervals.

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Format a UTC timestamp as RFC3339 using a `Z` suffix.
pub fn format_utc_rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format an activity duration as `{h}h{mm}m`, rounded to the nearest minute.
///
/// Negative or non-finite inputs are treated as zero.
pub fn format_duration_hm(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    let minutes = (seconds / 60.0).round() as u64;
    format!("{}h{:02}m", minutes / 60, minutes % 60)
}

/// End of an activity that starts at `start` and lasts `seconds`.
///
/// Sub-millisecond precision is dropped.
pub fn end_after(start: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    let millis = if seconds.is_finite() {
        (seconds.max(0.0) * 1000.0).round() as i64
    } else {
        0
    };
    start + Duration::milliseconds(millis)
}
