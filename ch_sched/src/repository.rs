//! ABOUTME: Persistence contract for jobs: atomic claim, save semantics,
//! ABOUTME: lease renewal, bulk selectors, and the shared save-plan ladder

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use ch_core::{Id, Result};

use crate::job::{DebounceStrategy, JobAttrs, JobState, JobType, JobWithState};

/// Options accepted by the save operations
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Identity of the worker performing the save
    pub last_modified_by: Option<String>,
}

/// Bulk-operation selector; an empty selector matches nothing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSelector {
    pub id: Option<Id>,
    pub ids: Vec<Id>,
    pub name: Option<String>,
    pub names: Vec<String>,
    pub not_names: Vec<String>,
    /// Subset match against the job payload
    pub data: Option<Value>,
}

impl JobSelector {
    pub fn by_id(id: Id) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn by_names(names: Vec<String>) -> Self {
        Self {
            names,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.ids.is_empty()
            && self.name.is_none()
            && self.names.is_empty()
            && self.not_names.is_empty()
            && self.data.is_none()
    }

    /// Whether a record satisfies every provided criterion
    pub fn matches(&self, attrs: &JobAttrs) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(id) = &self.id {
            if attrs.id.as_ref() != Some(id) {
                return false;
            }
        }
        if !self.ids.is_empty() {
            match &attrs.id {
                Some(id) if self.ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(name) = &self.name {
            if &attrs.name != name {
                return false;
            }
        }
        if !self.names.is_empty() && !self.names.contains(&attrs.name) {
            return false;
        }
        if !self.not_names.is_empty() && self.not_names.contains(&attrs.name) {
            return false;
        }
        if let Some(data) = &self.data {
            if !value_contains(&attrs.data, data) {
                return false;
            }
        }
        true
    }
}

/// Subset containment: every key of `needle` must be present in `haystack`
/// with a containing value; non-objects compare by equality
pub fn value_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(hay), Value::Object(need)) => need
            .iter()
            .all(|(k, v)| hay.get(k).map_or(false, |h| value_contains(h, v))),
        (h, n) => h == n,
    }
}

/// Whether a record matches a unique selector of dotted record paths, e.g.
/// `{"data.id": "X"}`
pub fn unique_selector_matches(attrs: &JobAttrs, selector: &Value) -> bool {
    let Ok(root) = serde_json::to_value(attrs) else {
        return false;
    };
    let Value::Object(criteria) = selector else {
        return false;
    };
    criteria.iter().all(|(path, expected)| {
        lookup_path(&root, path).map_or(false, |found| found == expected)
    })
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Which key the save operation upserts on, derived from the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKey {
    /// Update the row matching `{id, name}`
    ById,
    /// Upsert the one row keyed by `(name, type = single)`
    Single,
    /// Upsert the row matching `{name, unique selector}`
    Unique,
    /// Insert a new row
    Insert,
}

pub fn save_key(attrs: &JobAttrs) -> SaveKey {
    if attrs.id.is_some() {
        SaveKey::ById
    } else if attrs.job_type == JobType::Single {
        SaveKey::Single
    } else if attrs.unique.is_some() {
        SaveKey::Unique
    } else {
        SaveKey::Insert
    }
}

/// Outcome of resolving a save against the existing row
#[derive(Debug, Clone)]
pub struct SaveResolution {
    /// Row to persist; `None` means nothing is written
    pub write: Option<JobAttrs>,
    /// Record returned to the caller
    pub result: JobAttrs,
}

/// Resolve the write for a save, given the row the driver located for the
/// record's save key.
///
/// This encodes the discriminator ladder shared by every driver: by-id
/// updates return the input unchanged when the row vanished; single upserts
/// protect a due-or-past `next_run_at` with insert-only semantics on that
/// field; unique upserts honor `insert_only` and the debounce rules.
/// Drivers stamp `last_modified_by` before calling and assign ids to
/// inserted rows afterwards.
pub fn resolve_save(
    existing: Option<&JobAttrs>,
    incoming: &JobAttrs,
    now: DateTime<Utc>,
) -> SaveResolution {
    let write = match save_key(incoming) {
        SaveKey::ById => match existing {
            Some(_) => incoming.clone(),
            None => {
                return SaveResolution {
                    write: None,
                    result: incoming.clone(),
                }
            }
        },
        SaveKey::Single => match existing {
            None => incoming.clone(),
            Some(existing) => {
                let mut write = incoming.clone();
                write.id = existing.id.clone();
                if let Some(next) = incoming.next_run_at {
                    if next <= now {
                        write.next_run_at = existing.next_run_at;
                    }
                }
                write
            }
        },
        SaveKey::Unique => {
            let opts = incoming.unique_opts.clone().unwrap_or_default();
            match existing {
                None => {
                    let mut write = incoming.clone();
                    if let Some(debounce) = &opts.debounce {
                        match debounce.strategy {
                            DebounceStrategy::Trailing => {
                                write.next_run_at =
                                    Some(now + chrono::Duration::milliseconds(debounce.delay_ms as i64));
                                write.debounce_started_at = Some(now);
                            }
                            DebounceStrategy::Leading => {
                                write.debounce_started_at = Some(now);
                            }
                        }
                    }
                    write
                }
                Some(existing) => {
                    if let Some(debounce) = &opts.debounce {
                        match debounce.strategy {
                            DebounceStrategy::Trailing => {
                                let mut write = incoming.clone();
                                write.id = existing.id.clone();
                                let started = existing.debounce_started_at.unwrap_or(now);
                                write.debounce_started_at = Some(started);
                                write.next_run_at =
                                    Some(now + chrono::Duration::milliseconds(debounce.delay_ms as i64));
                                if let Some(max_wait) = debounce.max_wait_ms {
                                    if now - started
                                        >= chrono::Duration::milliseconds(max_wait as i64)
                                    {
                                        write.next_run_at = Some(now);
                                        write.debounce_started_at = None;
                                    }
                                }
                                write
                            }
                            DebounceStrategy::Leading => {
                                let mut write = existing.clone();
                                write.data = incoming.data.clone();
                                write.last_modified_by = incoming.last_modified_by.clone();
                                write
                            }
                        }
                    } else if opts.insert_only {
                        return SaveResolution {
                            write: None,
                            result: existing.clone(),
                        };
                    } else {
                        let mut write = incoming.clone();
                        write.id = existing.id.clone();
                        write
                    }
                }
            }
        }
        SaveKey::Insert => incoming.clone(),
    };
    SaveResolution {
        result: write.clone(),
        write: Some(write),
    }
}

/// Whether a row is claimable at scan time: never disabled, and either
/// unlocked and due before the scan cursor, or holding a stale lock
pub fn claimable(
    attrs: &JobAttrs,
    next_scan_at: DateTime<Utc>,
    lock_deadline: DateTime<Utc>,
) -> bool {
    if attrs.disabled {
        return false;
    }
    match attrs.locked_at {
        None => attrs.next_run_at.map_or(false, |next| next <= next_scan_at),
        Some(locked_at) => locked_at <= lock_deadline,
    }
}

/// Claim ranking: `next_run_at` ascending, then `priority` descending
pub fn claim_cmp(a: &JobAttrs, b: &JobAttrs) -> Ordering {
    match (a.next_run_at, b.next_run_at) {
        (Some(x), Some(y)) => x.cmp(&y).then(b.priority.cmp(&a.priority)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.priority.cmp(&a.priority),
    }
}

/// Read-side query options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub name: Option<String>,
    pub state: Option<JobState>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// One page of annotated jobs
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<JobWithState>,
    pub total: usize,
}

/// Per-name state counts for diagnostics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOverview {
    pub name: String,
    pub total: usize,
    pub scheduled: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub repeating: usize,
}

/// Persistence contract for job records.
///
/// Durability, atomicity of claim, and ordering are delegated to the
/// implementation: `get_next_job_to_run` must select and lock in one atomic
/// step (`findAndModify`, `UPDATE ... RETURNING ... FOR UPDATE SKIP LOCKED`,
/// or equivalent).
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn get_job_by_id(&self, id: &Id) -> Result<Option<JobAttrs>>;

    async fn query_jobs(&self, options: &QueryOptions) -> Result<JobPage>;

    async fn get_jobs_overview(&self) -> Result<Vec<JobOverview>>;

    async fn get_distinct_job_names(&self) -> Result<Vec<String>>;

    /// Count of jobs due now and not yet locked
    async fn get_queue_size(&self) -> Result<usize>;

    /// Insert or upsert per the record's save key; returns the saved record
    /// with its id assigned
    async fn save_job(&self, attrs: JobAttrs, options: &SaveOptions) -> Result<JobAttrs>;

    /// Partial update of the volatile state fields (`locked_at`,
    /// `next_run_at`, `last_run_at`, `last_finished_at`, `failed_at`,
    /// `fail_reason`, `fail_count`, `progress`, `last_modified_by`) matching
    /// `{id, name}`. Fails with `Error::NotFound` when the row is gone.
    async fn save_job_state(&self, attrs: &JobAttrs, options: &SaveOptions) -> Result<()>;

    /// Atomically find and lock the best-ranked claimable job of a name
    async fn get_next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobAttrs>>;

    /// Targeted lock attempt on an unlocked row with the exact same
    /// `next_run_at`; `None` means the race was lost
    async fn lock_job(&self, attrs: &JobAttrs) -> Result<Option<JobAttrs>>;

    async fn unlock_job(&self, attrs: &JobAttrs) -> Result<()>;

    async fn unlock_jobs(&self, ids: &[Id]) -> Result<()>;

    /// Returns the number of affected rows; an empty selector is a no-op
    async fn remove_jobs(&self, selector: &JobSelector) -> Result<u64>;

    async fn disable_jobs(&self, selector: &JobSelector) -> Result<u64>;

    async fn enable_jobs(&self, selector: &JobSelector) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DebounceOptions, UniqueOptions};
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn attrs(name: &str) -> JobAttrs {
        JobAttrs::new(name, Value::Null)
    }

    #[test]
    fn test_selector_empty_matches_nothing() {
        let selector = JobSelector::default();
        assert!(selector.is_empty());
        assert!(!selector.matches(&attrs("greet")));
    }

    #[test]
    fn test_selector_by_fields() {
        let id = Id::new();
        let mut job = attrs("greet");
        job.id = Some(id.clone());
        job.data = json!({"who": "world", "count": 3});

        assert!(JobSelector::by_id(id.clone()).matches(&job));
        assert!(JobSelector::by_name("greet").matches(&job));
        assert!(!JobSelector::by_name("other").matches(&job));
        assert!(JobSelector {
            ids: vec![id],
            ..Default::default()
        }
        .matches(&job));
        assert!(JobSelector {
            not_names: vec!["other".to_string()],
            ..Default::default()
        }
        .matches(&job));
        assert!(!JobSelector {
            not_names: vec!["greet".to_string()],
            ..Default::default()
        }
        .matches(&job));
        assert!(JobSelector {
            data: Some(json!({"who": "world"})),
            ..Default::default()
        }
        .matches(&job));
        assert!(!JobSelector {
            data: Some(json!({"who": "moon"})),
            ..Default::default()
        }
        .matches(&job));
    }

    #[test]
    fn test_unique_selector_paths() {
        let mut job = attrs("order");
        job.data = json!({"id": "X", "region": {"code": "eu"}});
        assert!(unique_selector_matches(&job, &json!({"data.id": "X"})));
        assert!(unique_selector_matches(
            &job,
            &json!({"data.region.code": "eu", "name": "order"})
        ));
        assert!(!unique_selector_matches(&job, &json!({"data.id": "Y"})));
        assert!(!unique_selector_matches(&job, &json!({"data.missing": 1})));
    }

    #[test]
    fn test_save_key_discrimination() {
        let mut job = attrs("greet");
        assert_eq!(save_key(&job), SaveKey::Insert);
        job.unique = Some(json!({"data.id": 1}));
        assert_eq!(save_key(&job), SaveKey::Unique);
        job.job_type = JobType::Single;
        assert_eq!(save_key(&job), SaveKey::Single);
        job.id = Some(Id::new());
        assert_eq!(save_key(&job), SaveKey::ById);
    }

    #[test]
    fn test_resolve_by_id_vanished_row() {
        let mut incoming = attrs("greet");
        incoming.id = Some(Id::new());
        let resolution = resolve_save(None, &incoming, Utc::now());
        assert!(resolution.write.is_none());
        assert_eq!(resolution.result.id, incoming.id);
    }

    #[test]
    fn test_resolve_single_protects_due_next_run_at() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut existing = attrs("tick");
        existing.id = Some(Id::new());
        existing.job_type = JobType::Single;
        existing.next_run_at = Some(utc("2026-03-02T08:00:00Z"));

        let mut incoming = attrs("tick");
        incoming.job_type = JobType::Single;
        incoming.next_run_at = Some(now);

        let resolution = resolve_save(Some(&existing), &incoming, now);
        let write = resolution.write.unwrap();
        assert_eq!(write.id, existing.id);
        // Due-or-past next_run_at is insert-only: the stored value wins.
        assert_eq!(write.next_run_at, existing.next_run_at);
    }

    #[test]
    fn test_resolve_single_future_next_run_at_updates() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut existing = attrs("tick");
        existing.id = Some(Id::new());
        existing.job_type = JobType::Single;
        existing.next_run_at = Some(utc("2026-03-02T10:00:00Z"));

        let mut incoming = attrs("tick");
        incoming.job_type = JobType::Single;
        incoming.next_run_at = Some(utc("2026-03-02T11:00:00Z"));

        let resolution = resolve_save(Some(&existing), &incoming, now);
        assert_eq!(
            resolution.write.unwrap().next_run_at,
            Some(utc("2026-03-02T11:00:00Z"))
        );
    }

    #[test]
    fn test_resolve_unique_insert_only_is_noop() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut existing = attrs("order");
        existing.id = Some(Id::new());
        existing.next_run_at = Some(utc("2026-03-02T10:00:00Z"));

        let mut incoming = attrs("order");
        incoming.unique = Some(json!({"data.id": "X"}));
        incoming.unique_opts = Some(UniqueOptions {
            insert_only: true,
            debounce: None,
        });
        incoming.next_run_at = Some(utc("2026-03-02T12:00:00Z"));

        let resolution = resolve_save(Some(&existing), &incoming, now);
        assert!(resolution.write.is_none());
        assert_eq!(resolution.result.next_run_at, existing.next_run_at);
    }

    #[test]
    fn test_resolve_unique_default_updates_row() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut existing = attrs("order");
        existing.id = Some(Id::new());

        let mut incoming = attrs("order");
        incoming.unique = Some(json!({"data.id": "X"}));
        incoming.next_run_at = Some(utc("2026-03-02T12:00:00Z"));

        let resolution = resolve_save(Some(&existing), &incoming, now);
        let write = resolution.write.unwrap();
        assert_eq!(write.id, existing.id);
        assert_eq!(write.next_run_at, incoming.next_run_at);
    }

    #[test]
    fn test_resolve_trailing_debounce_new_row() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut incoming = attrs("sync");
        incoming.unique = Some(json!({"data.key": "k"}));
        incoming.unique_opts = Some(UniqueOptions {
            insert_only: false,
            debounce: Some(DebounceOptions::trailing(5000)),
        });

        let write = resolve_save(None, &incoming, now).write.unwrap();
        assert_eq!(write.next_run_at, Some(now + chrono::Duration::seconds(5)));
        assert_eq!(write.debounce_started_at, Some(now));
    }

    #[test]
    fn test_resolve_trailing_debounce_pushes_and_retains_start() {
        let started = utc("2026-03-02T09:00:00Z");
        let now = utc("2026-03-02T09:00:03Z");
        let mut existing = attrs("sync");
        existing.id = Some(Id::new());
        existing.debounce_started_at = Some(started);

        let mut incoming = attrs("sync");
        incoming.unique = Some(json!({"data.key": "k"}));
        incoming.unique_opts = Some(UniqueOptions {
            insert_only: false,
            debounce: Some(DebounceOptions::trailing(5000)),
        });

        let write = resolve_save(Some(&existing), &incoming, now).write.unwrap();
        assert_eq!(write.next_run_at, Some(now + chrono::Duration::seconds(5)));
        assert_eq!(write.debounce_started_at, Some(started));
    }

    #[test]
    fn test_resolve_trailing_debounce_max_wait_forces_run() {
        let started = utc("2026-03-02T09:00:00Z");
        let now = utc("2026-03-02T09:00:10Z");
        let mut existing = attrs("sync");
        existing.id = Some(Id::new());
        existing.debounce_started_at = Some(started);

        let mut incoming = attrs("sync");
        incoming.unique = Some(json!({"data.key": "k"}));
        incoming.unique_opts = Some(UniqueOptions {
            insert_only: false,
            debounce: Some(DebounceOptions::trailing(5000).with_max_wait(10_000)),
        });

        let write = resolve_save(Some(&existing), &incoming, now).write.unwrap();
        assert_eq!(write.next_run_at, Some(now));
        assert!(write.debounce_started_at.is_none());
    }

    #[test]
    fn test_resolve_leading_debounce_keeps_run_refreshes_data() {
        let now = utc("2026-03-02T09:00:01Z");
        let mut existing = attrs("sync");
        existing.id = Some(Id::new());
        existing.next_run_at = Some(utc("2026-03-02T09:00:00Z"));
        existing.debounce_started_at = Some(utc("2026-03-02T09:00:00Z"));
        existing.data = json!({"v": 1});

        let mut incoming = attrs("sync");
        incoming.data = json!({"v": 2});
        incoming.next_run_at = Some(now);
        incoming.unique = Some(json!({"data.key": "k"}));
        incoming.unique_opts = Some(UniqueOptions {
            insert_only: false,
            debounce: Some(DebounceOptions::leading(5000)),
        });

        let write = resolve_save(Some(&existing), &incoming, now).write.unwrap();
        assert_eq!(write.next_run_at, existing.next_run_at);
        assert_eq!(write.data, json!({"v": 2}));
    }

    #[test]
    fn test_claimable_predicate() {
        let now = utc("2026-03-02T09:00:00Z");
        let next_scan = now + chrono::Duration::seconds(5);
        let lock_deadline = now - chrono::Duration::minutes(10);

        let mut job = attrs("greet");
        job.next_run_at = Some(now);
        assert!(claimable(&job, next_scan, lock_deadline));

        job.disabled = true;
        assert!(!claimable(&job, next_scan, lock_deadline));
        job.disabled = false;

        job.next_run_at = Some(now + chrono::Duration::minutes(1));
        assert!(!claimable(&job, next_scan, lock_deadline));

        // A fresh lock is not claimable, a stale one is.
        job.next_run_at = Some(now);
        job.locked_at = Some(now - chrono::Duration::minutes(1));
        assert!(!claimable(&job, next_scan, lock_deadline));
        job.locked_at = Some(now - chrono::Duration::minutes(11));
        assert!(claimable(&job, next_scan, lock_deadline));
    }

    #[test]
    fn test_claim_ranking() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut earlier = attrs("greet");
        earlier.next_run_at = Some(now);
        let mut later = attrs("greet");
        later.next_run_at = Some(now + chrono::Duration::seconds(1));
        assert_eq!(claim_cmp(&earlier, &later), Ordering::Less);

        let mut low = attrs("greet");
        low.next_run_at = Some(now);
        low.priority = 0;
        let mut high = attrs("greet");
        high.next_run_at = Some(now);
        high.priority = 10;
        assert_eq!(claim_cmp(&high, &low), Ordering::Less);
    }
}
