// ABOUTME: Identifiers assigned to persisted job records.
// ABOUTME: ULID-backed so ids sort by creation instant across workers.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Identifier a repository assigns to a job record on its first save.
///
/// Backed by a ULID, so ids minted later sort lexicographically after ids
/// minted earlier: sorting a set of job ids roughly recovers enqueue order
/// even across workers, and the creation instant can be read back out for
/// diagnostics.
///
/// # Examples
///
/// ```
/// use ch_core::Id;
/// let id = Id::new();
/// let parsed: Id = id.to_string().parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(ulid::Ulid);

impl Id {
    /// Mint a fresh id
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// The instant this id was minted.
    ///
    /// Job rows do not carry a separate creation timestamp; this recovers
    /// one from the id itself when inspecting stored jobs.
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0.timestamp_ms() as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<ulid::Ulid>()
            .map(Self)
            .map_err(|_| Error::Config(format!("Invalid job id '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip_and_garbage_rejection() {
        let id = Id::new();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let err = "not-a-job-id".parse::<Id>().unwrap_err();
        assert!(err.to_string().contains("Invalid job id"));
    }

    #[test]
    fn test_embeds_in_job_payloads() {
        let id = Id::new();
        let payload = serde_json::json!({ "job_id": id });
        let back: Id = serde_json::from_value(payload["job_id"].clone()).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_created_at_is_recent() {
        let id = Id::new();
        let age = Utc::now() - id.created_at();
        assert!(age >= chrono::Duration::zero());
        assert!(age < chrono::Duration::seconds(5));
    }
}
