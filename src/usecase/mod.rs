//! Business rules for schedules, executions and results.

mod result;
mod schedule;

pub use result::*;
pub use schedule::*;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `t + d`, saturating at the largest representable instant.
pub(crate) fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| t.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock time elapsed between two instants, zero if `end` is earlier.
pub(crate) fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or_default()
}
