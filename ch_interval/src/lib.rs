//! ABOUTME: Interval resolution and retry policy primitives for chime
//! ABOUTME: Cron and human-duration parsing, priorities, and backoff strategies

pub mod backoff;
pub mod interval;
pub mod priority;

pub use backoff::{
    aggressive, combine, constant, exponential, linear, relaxed, standard, when, Backoff,
    BackoffContext, BackoffStrategy,
};
pub use interval::{next_fire_time, next_time_of_day, parse_timezone};
pub use priority::{parse_priority, PrioritySpec};
