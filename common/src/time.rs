// Wall-clock helpers used for message expiration.
//
// These values come from SystemTime::now() and are only meant for
// admission control with generous windows (packet expiration, TTLs).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Seconds timestamps used to determine it using its type
pub type TimestampSeconds = u64;

// Millis timestamps used to determine it using its type
pub type TimestampMillis = u64;

// A clock set before 1970 is reported as the epoch itself
#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Return timestamp in milliseconds
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
