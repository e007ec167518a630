//! Process-wide time helpers.
//!
//! Event timestamps come from the source and are monotonic nanoseconds;
//! these helpers supply the agent's own readings for rotation pacing and
//! frame timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in nanoseconds since the epoch.
///
/// Saturates to zero if the system clock reads before the epoch.
#[must_use]
pub fn wall_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
