//! FILETIME timestamp conversion.
//!
//! A FILETIME is a count of 100-nanosecond ticks since 1601-01-01 UTC.
//! Encoding keeps whole seconds only; decoding keeps every tick, so a
//! round trip is accurate to the second.

use chrono::{DateTime, Utc};

/// January 1, 1970 expressed as FILETIME ticks.
pub const UNIX_EPOCH_AS_FILETIME: u64 = 116_444_736_000_000_000;

/// FILETIME ticks per second.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

const NANOS_PER_TICK: u32 = 100;

/// Convert a calendar time to FILETIME ticks, truncating to whole seconds.
///
/// Times before 1601 saturate to zero.
pub fn to_filetime(time: &DateTime<Utc>) -> u64 {
    let ticks = i128::from(time.timestamp()) * i128::from(TICKS_PER_SECOND)
        + i128::from(UNIX_EPOCH_AS_FILETIME);
    u64::try_from(ticks.max(0)).unwrap_or(u64::MAX)
}

/// Convert FILETIME ticks to a calendar time, keeping sub-second ticks.
pub fn from_filetime(ticks: u64) -> DateTime<Utc> {
    let since_unix = i128::from(ticks) - i128::from(UNIX_EPOCH_AS_FILETIME);
    let per_second = i128::from(TICKS_PER_SECOND);
    let secs = since_unix.div_euclid(per_second) as i64;
    let nanos = since_unix.rem_euclid(per_second) as u32 * NANOS_PER_TICK;
    // Every u64 tick count is within chrono's supported range.
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
