//! ABOUTME: Symbolic job priority parsing
//! ABOUTME: Maps the literal names onto the numeric scale used for ranking

use ch_core::{Error, Result};

/// Parse a priority literal or numeric string
///
/// Literals: lowest = -20, low = -10, normal = 0, high = 10, highest = 20.
/// Anything else must parse as an integer.
pub fn parse_priority(value: &str) -> Result<i32> {
    match value.trim().to_ascii_lowercase().as_str() {
        "lowest" => Ok(-20),
        "low" => Ok(-10),
        "normal" => Ok(0),
        "high" => Ok(10),
        "highest" => Ok(20),
        other => other
            .parse::<i32>()
            .map_err(|_| Error::Config(format!("Unknown priority '{}'", value))),
    }
}

/// A priority given either numerically or by name
#[derive(Debug, Clone)]
pub enum PrioritySpec {
    Value(i32),
    Name(String),
}

impl PrioritySpec {
    /// Resolve to the numeric priority
    pub fn resolve(&self) -> Result<i32> {
        match self {
            PrioritySpec::Value(v) => Ok(*v),
            PrioritySpec::Name(name) => parse_priority(name),
        }
    }
}

impl From<i32> for PrioritySpec {
    fn from(value: i32) -> Self {
        PrioritySpec::Value(value)
    }
}

impl From<&str> for PrioritySpec {
    fn from(value: &str) -> Self {
        PrioritySpec::Name(value.to_string())
    }
}

impl From<String> for PrioritySpec {
    fn from(value: String) -> Self {
        PrioritySpec::Name(value)
    }
}
