// ABOUTME: Utilities for working with millisecond durations.
// ABOUTME: The engine stores every interval as UTC milliseconds.
use crate::{Error, Result};

/// Convert a millisecond count into a chrono duration
///
/// # Examples
///
/// ```
/// use ch_core::duration_from_ms;
/// assert_eq!(duration_from_ms(1500).num_milliseconds(), 1500);
/// ```
pub fn duration_from_ms(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms as i64)
}

/// Convert a chrono duration into milliseconds, clamping negatives to zero
///
/// # Examples
///
/// ```
/// use ch_core::ms_from_duration;
/// assert_eq!(ms_from_duration(chrono::Duration::seconds(2)), 2000);
/// assert_eq!(ms_from_duration(chrono::Duration::seconds(-2)), 0);
/// ```
pub fn ms_from_duration(duration: chrono::Duration) -> u64 {
    duration.num_milliseconds().max(0) as u64
}

/// Parse a duration given either as a bare millisecond count ("5000") or a
/// humantime string ("5 seconds", "2h 30m")
///
/// # Examples
///
/// ```
/// use ch_core::parse_duration_ms;
/// assert_eq!(parse_duration_ms("250").unwrap(), 250);
/// assert_eq!(parse_duration_ms("5 seconds").unwrap(), 5000);
/// ```
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Ok(ms);
    }
    humantime::parse_duration(trimmed)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| Error::Config(format!("Invalid duration '{}': {}", input, e)))
}
