//! Wall-clock helpers. All persisted timestamps are Unix epoch based.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Returns 0 if the clock is before 1970.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    reason = "u64 milliseconds covers the next few hundred million years"
)]
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}
