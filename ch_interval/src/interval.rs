//! ABOUTME: Next-fire-time computation for cron and human-readable intervals
//! ABOUTME: Timezone-aware evaluation with wall-clock time-of-day support

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use ch_core::{Error, Result};

/// Accepted wall-clock formats for `repeat_at` style times
const TIME_OF_DAY_FORMATS: &[&str] = &[
    "%H:%M:%S",
    "%H:%M",
    "%I:%M:%S %p",
    "%I:%M %p",
    "%I:%M%p",
    "%I %p",
    "%I%p",
];

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| Error::Config(format!("Invalid timezone '{}'", name)))
}

/// Compute the next fire time strictly after `after` for an interval string.
///
/// The interval is tried as a cron expression first (5-field expressions are
/// normalized to the 6-field seconds form), then as a human-readable duration
/// such as "5 seconds". Cron evaluation happens in the given timezone before
/// conversion back to UTC. If the cron engine emits the reference instant
/// itself, the reference is advanced by one second and re-evaluated.
pub fn next_fire_time(
    interval: &str,
    tz: Option<Tz>,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let trimmed = interval.trim();
    if trimmed.is_empty() {
        return Err(resolve_error(interval));
    }

    if let Ok(schedule) = Schedule::from_str(&normalize_cron(trimmed)) {
        let mut next = cron_after(&schedule, tz, after)
            .ok_or_else(|| Error::Config(format!("No upcoming fire time for '{}'", interval)))?;
        if next <= after {
            next = cron_after(&schedule, tz, after + Duration::seconds(1))
                .ok_or_else(|| Error::Config(format!("No upcoming fire time for '{}'", interval)))?;
        }
        return Ok(next);
    }

    match humantime::parse_duration(trimmed) {
        Ok(duration) => {
            let delta = Duration::from_std(duration)
                .map_err(|_| Error::Config(format!("Interval '{}' is out of range", interval)))?;
            Ok(after + delta)
        }
        Err(_) => Err(resolve_error(interval)),
    }
}

/// Compute the next wall-clock occurrence of a time of day such as "9:00 am".
///
/// An occurrence equal to the reference instant counts as already passed and
/// resolves to the same time tomorrow.
pub fn next_time_of_day(
    time_of_day: &str,
    tz: Option<Tz>,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let time = parse_time_of_day(time_of_day)?;
    let zone = tz.unwrap_or(chrono_tz::UTC);
    let local_after = after.with_timezone(&zone);
    let mut date = local_after.date_naive();

    // A DST gap can swallow a candidate; two extra days covers any transition.
    for _ in 0..3 {
        let candidate = match zone.from_local_datetime(&date.and_time(time)) {
            chrono::LocalResult::Single(t) => Some(t),
            chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
            chrono::LocalResult::None => None,
        };
        if let Some(candidate) = candidate {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > after {
                return Ok(candidate);
            }
        }
        date = date
            .succ_opt()
            .ok_or_else(|| Error::Config(format!("Time '{}' is out of range", time_of_day)))?;
    }

    Err(resolve_error(time_of_day))
}

/// The deterministic failure reason stored on jobs whose interval cannot be
/// resolved
pub fn resolve_error(interval: &str) -> Error {
    Error::Config(format!("Cannot resolve interval '{}'", interval))
}

fn parse_time_of_day(input: &str) -> Result<NaiveTime> {
    let trimmed = input.trim();
    for format in TIME_OF_DAY_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(trimmed, format) {
            return Ok(time);
        }
    }
    Err(resolve_error(input))
}

/// Normalize 5-field cron expressions to the 6-field seconds form
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

fn cron_after(schedule: &Schedule, tz: Option<Tz>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match tz {
        Some(zone) => schedule
            .after(&after.with_timezone(&zone))
            .next()
            .map(|t| t.with_timezone(&Utc)),
        None => schedule.after(&after).next(),
    }
}
