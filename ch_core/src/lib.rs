//! ABOUTME: Core types, errors, IDs, and time helpers
//! ABOUTME: Foundation crate used by all other chime components

pub mod error;
pub mod id;
pub mod time;

pub use error::{Error, Result};
pub use id::Id;
pub use time::{duration_from_ms, ms_from_duration, parse_duration_ms};
