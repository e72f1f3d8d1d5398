//! ABOUTME: The persisted job record and its in-memory handle
//! ABOUTME: Builder operations, state derivation, and lifecycle operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use ch_core::{Error, Id, Result};
use ch_interval::{next_fire_time, next_time_of_day, parse_timezone, PrioritySpec};

use crate::channel::JobNotification;
use crate::repository::{JobSelector, SaveOptions};
use crate::scheduler::SchedulerContext;

/// Persistence discriminator: `Single` jobs keep at most one row per name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Normal,
    Single,
}

/// Debounce coalescing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceStrategy {
    /// Each save pushes the run out to `now + delay`
    Trailing,
    /// The first save runs immediately; later saves only refresh data
    Leading,
}

/// Debounce window configuration carried inside the unique options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebounceOptions {
    pub delay_ms: u64,
    pub strategy: DebounceStrategy,
    /// Upper bound on how long trailing saves may keep deferring the run
    pub max_wait_ms: Option<u64>,
}

impl DebounceOptions {
    pub fn trailing(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            strategy: DebounceStrategy::Trailing,
            max_wait_ms: None,
        }
    }

    pub fn leading(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            strategy: DebounceStrategy::Leading,
            max_wait_ms: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = Some(max_wait_ms);
        self
    }
}

/// Options attached to a unique selector, applied only during save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniqueOptions {
    /// Leave an existing matching row untouched instead of updating it
    pub insert_only: bool,
    pub debounce: Option<DebounceOptions>,
}

/// The canonical persisted job record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobAttrs {
    /// Assigned on first save, stable thereafter
    pub id: Option<Id>,
    pub name: String,
    /// Opaque payload handed to the handler
    pub data: Value,
    /// Higher runs earlier among equally due jobs
    pub priority: i32,
    pub job_type: JobType,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub fail_reason: Option<String>,
    pub repeat_interval: Option<String>,
    pub repeat_timezone: Option<String>,
    pub repeat_at: Option<String>,
    pub disabled: bool,
    /// Execute out-of-process through the fork helper
    pub fork: bool,
    /// 0-100, reported by handlers through `touch`
    pub progress: Option<u8>,
    /// Deduplication selector, consulted only during save
    pub unique: Option<Value>,
    pub unique_opts: Option<UniqueOptions>,
    pub debounce_started_at: Option<DateTime<Utc>>,
    pub last_modified_by: Option<String>,
}

impl Default for JobAttrs {
    fn default() -> Self {
        Self::new("", Value::Null)
    }
}

impl JobAttrs {
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            data,
            priority: 0,
            job_type: JobType::Normal,
            next_run_at: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            locked_at: None,
            fail_count: 0,
            fail_reason: None,
            repeat_interval: None,
            repeat_timezone: None,
            repeat_at: None,
            disabled: false,
            fork: false,
            progress: None,
            unique: None,
            unique_opts: None,
            debounce_started_at: None,
            last_modified_by: None,
        }
    }

    /// Whether the job recurs via an interval or a wall-clock time
    pub fn is_repeating(&self) -> bool {
        self.repeat_interval.is_some() || self.repeat_at.is_some()
    }

    /// Whether the lock is still live for the given lease duration
    pub fn is_locked(&self, lock_lifetime: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.locked_at.map_or(false, |l| now - l < lock_lifetime)
    }

    /// Running means locked with a run started after the last finish
    pub fn is_running_state(&self) -> bool {
        self.locked_at.is_some()
            && self.last_run_at.is_some()
            && match (self.last_run_at, self.last_finished_at) {
                (Some(run), Some(finished)) => run > finished,
                (Some(_), None) => true,
                _ => false,
            }
    }

    /// Failed means the most recent finish left a failure without a later
    /// success
    pub fn is_failed_state(&self) -> bool {
        self.fail_count > 0
            && self.failed_at.map_or(false, |failed| {
                self.last_finished_at.map_or(true, |fin| failed >= fin)
            })
    }

    /// Derive the lifecycle state at `now`
    pub fn compute_state(&self, now: DateTime<Utc>) -> JobState {
        if self.is_running_state() {
            JobState::Running
        } else if self.is_failed_state() {
            JobState::Failed
        } else if let Some(next) = self.next_run_at {
            if next <= now && !self.disabled && self.locked_at.is_none() {
                JobState::Queued
            } else {
                JobState::Scheduled
            }
        } else if self.last_finished_at.is_some() {
            JobState::Completed
        } else {
            JobState::Scheduled
        }
    }
}

/// Derived lifecycle state of a persisted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Queued,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// A job record annotated with its derived state, used by the read side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithState {
    #[serde(flatten)]
    pub attrs: JobAttrs,
    pub state: JobState,
    pub repeating: bool,
}

impl JobWithState {
    pub fn derive(attrs: JobAttrs, now: DateTime<Utc>) -> Self {
        let state = attrs.compute_state(now);
        let repeating = attrs.is_repeating();
        Self {
            attrs,
            state,
            repeating,
        }
    }
}

/// When a one-shot job should run
#[derive(Debug, Clone)]
pub enum When {
    At(DateTime<Utc>),
    In(std::time::Duration),
    Text(String),
}

impl When {
    /// Resolve against the current instant
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            When::At(at) => Ok(*at),
            When::In(duration) => {
                let delta = chrono::Duration::from_std(*duration)
                    .map_err(|_| Error::Config("Schedule offset is out of range".to_string()))?;
                Ok(now + delta)
            }
            When::Text(text) => {
                let trimmed = text.trim();
                if trimmed.eq_ignore_ascii_case("now") {
                    return Ok(now);
                }
                let duration_text = trimmed.strip_prefix("in ").unwrap_or(trimmed);
                if let Ok(duration) = humantime::parse_duration(duration_text) {
                    return When::In(duration).resolve(now);
                }
                if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
                    return Ok(at.with_timezone(&Utc));
                }
                if let Ok(at) = next_time_of_day(trimmed, None, now) {
                    return Ok(at);
                }
                Err(Error::Config(format!(
                    "Cannot resolve schedule time '{}'",
                    text
                )))
            }
        }
    }
}

impl From<DateTime<Utc>> for When {
    fn from(at: DateTime<Utc>) -> Self {
        When::At(at)
    }
}

impl From<std::time::Duration> for When {
    fn from(duration: std::time::Duration) -> Self {
        When::In(duration)
    }
}

impl From<&str> for When {
    fn from(text: &str) -> Self {
        When::Text(text.to_string())
    }
}

impl From<String> for When {
    fn from(text: String) -> Self {
        When::Text(text)
    }
}

/// Options for `repeat_every`
#[derive(Debug, Clone, Default)]
pub struct RepeatOptions {
    pub timezone: Option<String>,
    /// Skip the run that would otherwise fire immediately
    pub skip_immediate: bool,
}

/// Mark failure bookkeeping on a record
pub(crate) fn fail_attrs(attrs: &mut JobAttrs, reason: String, now: DateTime<Utc>) {
    attrs.fail_reason = Some(reason);
    attrs.fail_count += 1;
    attrs.failed_at = Some(now);
}

/// Recompute `next_run_at` from the repeat settings.
///
/// An unresolvable interval or timezone marks the job failed with the
/// deterministic reason and leaves `next_run_at` empty.
pub(crate) fn compute_next_run_at(attrs: &mut JobAttrs, now: DateTime<Utc>) {
    let tz = match attrs
        .repeat_timezone
        .as_deref()
        .map(parse_timezone)
        .transpose()
    {
        Ok(tz) => tz,
        Err(e) => {
            fail_attrs(attrs, e.to_string(), now);
            attrs.next_run_at = None;
            return;
        }
    };

    if let Some(interval) = attrs.repeat_interval.clone() {
        let reference = attrs.last_run_at.unwrap_or(now);
        match next_fire_time(&interval, tz, reference) {
            Ok(next) => attrs.next_run_at = Some(next),
            Err(e) => {
                fail_attrs(attrs, e.to_string(), now);
                attrs.next_run_at = None;
            }
        }
    } else if let Some(at) = attrs.repeat_at.clone() {
        match next_time_of_day(&at, tz, now) {
            Ok(next) => attrs.next_run_at = Some(next),
            Err(e) => {
                fail_attrs(attrs, e.to_string(), now);
                attrs.next_run_at = None;
            }
        }
    }
}

/// Live handle to a job record.
///
/// Clones share the same attribute set, so the processor, the handler, and
/// lease renewal all observe one another's updates.
#[derive(Clone)]
pub struct Job {
    attrs: Arc<Mutex<JobAttrs>>,
    ctx: Arc<SchedulerContext>,
    cancel: CancellationToken,
}

impl Job {
    pub(crate) fn new(attrs: JobAttrs, ctx: Arc<SchedulerContext>) -> Self {
        Self {
            attrs: Arc::new(Mutex::new(attrs)),
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Snapshot of the current attributes
    pub fn attrs(&self) -> JobAttrs {
        self.with_attrs(|a| a.clone())
    }

    pub(crate) fn with_attrs<R>(&self, f: impl FnOnce(&mut JobAttrs) -> R) -> R {
        let mut guard = self
            .attrs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn id(&self) -> Option<Id> {
        self.with_attrs(|a| a.id.clone())
    }

    pub fn name(&self) -> String {
        self.with_attrs(|a| a.name.clone())
    }

    pub fn data(&self) -> Value {
        self.with_attrs(|a| a.data.clone())
    }

    /// Deserialize the payload into a concrete type
    pub fn parsed_data<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let data = self.data();
        serde_json::from_value(data)
            .map_err(|e| Error::Config(format!("Failed to parse job data: {}", e)))
    }

    /// Cooperative cancellation flag for handlers
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Set when the job should next run
    pub fn schedule(&self, when: impl Into<When>) -> Result<&Self> {
        let at = when.into().resolve(Utc::now())?;
        self.with_attrs(|a| a.next_run_at = Some(at));
        Ok(self)
    }

    /// Make the job recurring on a cron or human-readable interval
    pub fn repeat_every(&self, interval: &str, options: RepeatOptions) -> Result<&Self> {
        let now = Utc::now();
        self.with_attrs(|a| {
            a.repeat_interval = Some(interval.to_string());
            a.repeat_timezone = options.timezone.clone();
            a.repeat_at = None;
            compute_next_run_at(a, now);
            if options.skip_immediate {
                a.last_run_at = a.next_run_at;
                compute_next_run_at(a, now);
            }
        });
        self.check_resolve_failure()
    }

    /// Make the job recur at a wall-clock time of day
    pub fn repeat_at(&self, time: &str) -> Result<&Self> {
        let now = Utc::now();
        self.with_attrs(|a| {
            a.repeat_at = Some(time.to_string());
            a.repeat_interval = None;
            compute_next_run_at(a, now);
        });
        self.check_resolve_failure()
    }

    /// Set the job priority by value or literal name
    pub fn priority(&self, priority: impl Into<PrioritySpec>) -> Result<&Self> {
        let value = priority.into().resolve()?;
        self.with_attrs(|a| a.priority = value);
        Ok(self)
    }

    /// Deduplicate saves by an arbitrary selector of dotted record paths
    pub fn unique(&self, selector: Value, options: UniqueOptions) -> &Self {
        self.with_attrs(|a| {
            a.unique = Some(selector);
            a.unique_opts = Some(options);
        });
        self
    }

    /// Coalesce repeated saves of the same unique key into one run
    pub fn debounce(&self, options: DebounceOptions) -> &Self {
        self.with_attrs(|a| {
            let mut opts = a.unique_opts.clone().unwrap_or_default();
            opts.debounce = Some(options);
            a.unique_opts = Some(opts);
        });
        self
    }

    pub fn disable(&self) -> &Self {
        self.with_attrs(|a| a.disabled = true);
        self
    }

    pub fn enable(&self) -> &Self {
        self.with_attrs(|a| a.disabled = false);
        self
    }

    /// Execute out-of-process through the configured fork helper
    pub fn fork_mode(&self, enabled: bool) -> &Self {
        self.with_attrs(|a| a.fork = enabled);
        self
    }

    /// Persist the record and broadcast a save notification (best-effort)
    pub async fn save(&self) -> Result<()> {
        if self.ctx.config().forked_worker {
            return Err(Error::Config(
                "save is disabled in forked workers".to_string(),
            ));
        }
        let snapshot = self.attrs();
        let opts = SaveOptions {
            last_modified_by: Some(self.ctx.instance_name.clone()),
        };
        let saved = self.ctx.repository.save_job(snapshot, &opts).await?;
        let notification = JobNotification::for_job(&saved, Some(self.ctx.instance_name.clone()));
        self.with_attrs(|a| *a = saved);
        self.ctx.publish_notification(notification).await;
        Ok(())
    }

    /// Delete the persisted row
    pub async fn remove(&self) -> Result<u64> {
        let id = self
            .id()
            .ok_or_else(|| Error::Config("Cannot remove an unsaved job".to_string()))?;
        self.ctx
            .repository
            .remove_jobs(&JobSelector::by_id(id))
            .await
    }

    /// Refresh the lease and optionally report progress.
    ///
    /// Fails with `Error::Canceled` when the job was canceled out from under
    /// the handler, either via the cooperative token or by row removal.
    pub async fn touch(&self, progress: Option<u8>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled(format!(
                "job '{}' was canceled",
                self.name()
            )));
        }
        if let Some(p) = progress {
            if p > 100 {
                return Err(Error::Config(format!("Progress {} is out of range", p)));
            }
        }
        let snapshot = self.with_attrs(|a| {
            a.locked_at = Some(Utc::now());
            if progress.is_some() {
                a.progress = progress;
            }
            a.clone()
        });
        let opts = SaveOptions {
            last_modified_by: Some(self.ctx.instance_name.clone()),
        };
        match self.ctx.repository.save_job_state(&snapshot, &opts).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => Err(Error::Canceled(format!(
                "job '{}' no longer exists",
                snapshot.name
            ))),
            Err(e) => Err(e),
        }
    }

    /// Mark the record failed with a reason
    pub fn fail(&self, reason: impl Into<String>) -> &Self {
        let now = Utc::now();
        self.with_attrs(|a| fail_attrs(a, reason.into(), now));
        self
    }

    /// Whether the job is currently running, re-read from the repository
    /// when persisted
    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.refreshed().await?.is_running_state())
    }

    /// Whether the lease on this job has lapsed
    pub async fn is_expired(&self) -> Result<bool> {
        let attrs = self.refreshed().await?;
        let lifetime = self.ctx.lock_lifetime_for(&attrs.name).await;
        Ok(attrs
            .locked_at
            .map_or(false, |l| Utc::now() - l >= lifetime))
    }

    async fn refreshed(&self) -> Result<JobAttrs> {
        let snapshot = self.attrs();
        match &snapshot.id {
            Some(id) => match self.ctx.repository.get_job_by_id(id).await? {
                Some(attrs) => {
                    self.with_attrs(|a| *a = attrs.clone());
                    Ok(attrs)
                }
                None => Ok(snapshot),
            },
            None => Ok(snapshot),
        }
    }

    fn check_resolve_failure(&self) -> Result<&Self> {
        match self.with_attrs(|a| {
            if a.next_run_at.is_none() && a.fail_reason.is_some() {
                a.fail_reason.clone()
            } else {
                None
            }
        }) {
            Some(reason) => Err(Error::Config(reason)),
            None => Ok(self),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attrs = self.attrs();
        f.debug_struct("Job")
            .field("id", &attrs.id)
            .field("name", &attrs.name)
            .field("next_run_at", &attrs.next_run_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_new_attrs_defaults() {
        let attrs = JobAttrs::new("greet", Value::Null);
        assert_eq!(attrs.name, "greet");
        assert_eq!(attrs.priority, 0);
        assert_eq!(attrs.job_type, JobType::Normal);
        assert_eq!(attrs.fail_count, 0);
        assert!(!attrs.disabled);
        assert!(attrs.id.is_none());
    }

    #[test]
    fn test_attrs_serde_roundtrip() {
        let mut attrs = JobAttrs::new("greet", serde_json::json!({"who": "world"}));
        attrs.id = Some(Id::new());
        attrs.next_run_at = Some(utc("2026-03-02T09:00:00Z"));
        attrs.unique = Some(serde_json::json!({"data.who": "world"}));
        attrs.unique_opts = Some(UniqueOptions {
            insert_only: true,
            debounce: Some(DebounceOptions::trailing(500).with_max_wait(5000)),
        });
        let json = serde_json::to_string(&attrs).unwrap();
        let back: JobAttrs = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, attrs.id);
        assert_eq!(back.next_run_at, attrs.next_run_at);
        assert_eq!(back.unique_opts, attrs.unique_opts);
    }

    #[test]
    fn test_lock_liveness() {
        let mut attrs = JobAttrs::new("greet", Value::Null);
        let now = utc("2026-03-02T09:00:00Z");
        attrs.locked_at = Some(now - chrono::Duration::seconds(30));
        assert!(attrs.is_locked(chrono::Duration::seconds(60), now));
        assert!(!attrs.is_locked(chrono::Duration::seconds(30), now));
        attrs.locked_at = None;
        assert!(!attrs.is_locked(chrono::Duration::seconds(60), now));
    }

    #[test]
    fn test_state_running() {
        let mut attrs = JobAttrs::new("greet", Value::Null);
        let now = utc("2026-03-02T09:00:00Z");
        attrs.locked_at = Some(now);
        attrs.last_run_at = Some(now);
        assert_eq!(attrs.compute_state(now), JobState::Running);

        attrs.last_finished_at = Some(now + chrono::Duration::seconds(1));
        assert_ne!(
            attrs.compute_state(now + chrono::Duration::seconds(2)),
            JobState::Running
        );
    }

    #[test]
    fn test_state_queued_vs_scheduled() {
        let mut attrs = JobAttrs::new("greet", Value::Null);
        let now = utc("2026-03-02T09:00:00Z");
        attrs.next_run_at = Some(now + chrono::Duration::hours(1));
        assert_eq!(attrs.compute_state(now), JobState::Scheduled);

        attrs.next_run_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(attrs.compute_state(now), JobState::Queued);

        attrs.disabled = true;
        assert_eq!(attrs.compute_state(now), JobState::Scheduled);
    }

    #[test]
    fn test_state_completed_and_failed() {
        let mut attrs = JobAttrs::new("greet", Value::Null);
        let now = utc("2026-03-02T09:00:00Z");
        attrs.last_run_at = Some(now - chrono::Duration::seconds(5));
        attrs.last_finished_at = Some(now - chrono::Duration::seconds(4));
        assert_eq!(attrs.compute_state(now), JobState::Completed);

        fail_attrs(&mut attrs, "boom".to_string(), now - chrono::Duration::seconds(4));
        assert_eq!(attrs.compute_state(now), JobState::Failed);

        // A later success clears the failed state.
        attrs.last_finished_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(attrs.compute_state(now), JobState::Completed);
    }

    #[test]
    fn test_when_resolution() {
        let now = utc("2026-03-02T09:00:00Z");
        assert_eq!(When::from(now).resolve(now).unwrap(), now);
        assert_eq!(
            When::from(std::time::Duration::from_secs(60)).resolve(now).unwrap(),
            now + chrono::Duration::seconds(60)
        );
        assert_eq!(
            When::from("in 1 hour").resolve(now).unwrap(),
            now + chrono::Duration::hours(1)
        );
        assert_eq!(
            When::from("5 minutes").resolve(now).unwrap(),
            now + chrono::Duration::minutes(5)
        );
        assert_eq!(When::from("now").resolve(now).unwrap(), now);
        assert_eq!(
            When::from("2026-04-01T00:00:00Z").resolve(now).unwrap(),
            utc("2026-04-01T00:00:00Z")
        );
        assert!(When::from("whenever you like").resolve(now).is_err());
    }

    #[test]
    fn test_compute_next_run_at_interval() {
        let now = utc("2026-03-02T08:30:00Z");
        let mut attrs = JobAttrs::new("tick", Value::Null);
        attrs.repeat_interval = Some("0 0 9 * * *".to_string());
        compute_next_run_at(&mut attrs, now);
        assert_eq!(attrs.next_run_at, Some(utc("2026-03-02T09:00:00Z")));
        assert_eq!(attrs.fail_count, 0);
    }

    #[test]
    fn test_compute_next_run_at_uses_last_run() {
        let now = utc("2026-03-02T09:00:30Z");
        let mut attrs = JobAttrs::new("tick", Value::Null);
        attrs.repeat_interval = Some("1 minute".to_string());
        attrs.last_run_at = Some(utc("2026-03-02T09:00:00Z"));
        compute_next_run_at(&mut attrs, now);
        assert_eq!(attrs.next_run_at, Some(utc("2026-03-02T09:01:00Z")));
        // Strictly after the last run.
        assert!(attrs.next_run_at.unwrap() > attrs.last_run_at.unwrap());
    }

    #[test]
    fn test_compute_next_run_at_bad_interval_marks_failed() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut attrs = JobAttrs::new("tick", Value::Null);
        attrs.repeat_interval = Some("gibberish schedule".to_string());
        compute_next_run_at(&mut attrs, now);
        assert!(attrs.next_run_at.is_none());
        assert_eq!(attrs.fail_count, 1);
        assert!(attrs
            .fail_reason
            .as_deref()
            .unwrap()
            .contains("Cannot resolve interval 'gibberish schedule'"));
    }

    #[test]
    fn test_compute_next_run_at_bad_timezone_marks_failed() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut attrs = JobAttrs::new("tick", Value::Null);
        attrs.repeat_interval = Some("0 0 9 * * *".to_string());
        attrs.repeat_timezone = Some("Nowhere/Special".to_string());
        compute_next_run_at(&mut attrs, now);
        assert!(attrs.next_run_at.is_none());
        assert_eq!(attrs.fail_count, 1);
    }

    #[test]
    fn test_fail_attrs_monotonic_count() {
        let now = utc("2026-03-02T09:00:00Z");
        let mut attrs = JobAttrs::new("flaky", Value::Null);
        fail_attrs(&mut attrs, "first".to_string(), now);
        fail_attrs(&mut attrs, "second".to_string(), now);
        assert_eq!(attrs.fail_count, 2);
        assert_eq!(attrs.fail_reason.as_deref(), Some("second"));
        assert_eq!(attrs.failed_at, Some(now));
    }
}
