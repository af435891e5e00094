//! Conversions between wall-clock timestamps and `std::time::Duration` spans.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Time elapsed from `then` to `now`; zero if `then` is in the future.
pub(crate) fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// `now - span`, saturating at the earliest representable instant.
pub(crate) fn before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(span)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn hours(d: Duration) -> f64 {
    d.as_secs_f64() / 3600.0
}

pub(crate) fn minutes(d: Duration) -> f64 {
    d.as_secs_f64() / 60.0
}
