//! ABOUTME: In-memory job repository with full contract semantics
//! ABOUTME: Claims are atomic under one mutex; failures can be injected

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ch_core::{Error, Id, Result};
use ch_sched::repository::{
    claim_cmp, claimable, resolve_save, save_key, unique_selector_matches, SaveKey,
};
use ch_sched::{
    JobAttrs, JobOverview, JobPage, JobRepository, JobSelector, JobType, JobWithState,
    QueryOptions, SaveOptions,
};

/// Map-backed repository double.
///
/// Everything happens under one mutex, which makes claim selection and lock
/// stamping atomic exactly the way a real driver achieves with
/// `findAndModify` or `SKIP LOCKED`.
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<Id, JobAttrs>>,
    connected: AtomicBool,
    fail_next: Mutex<Option<String>>,
}

impl MemoryJobRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            fail_next: Mutex::new(None),
        })
    }

    /// Make the next call of the named operation fail with a repository error
    pub fn fail_next(&self, operation: &str) {
        *self.guard(&self.fail_next) = Some(operation.to_string());
    }

    /// Seed a row directly, assigning an id when absent
    pub fn insert_raw(&self, mut attrs: JobAttrs) -> JobAttrs {
        let id = attrs.id.clone().unwrap_or_else(Id::new);
        attrs.id = Some(id.clone());
        self.guard(&self.jobs).insert(id, attrs.clone());
        attrs
    }

    /// Snapshot of every stored row
    pub fn all(&self) -> Vec<JobAttrs> {
        self.guard(&self.jobs).values().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn guard<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn maybe_fail(&self, operation: &str) -> Result<()> {
        let mut failure = self.guard(&self.fail_next);
        if failure.as_deref() == Some(operation) {
            *failure = None;
            return Err(Error::Repository(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    fn find_existing(
        jobs: &HashMap<Id, JobAttrs>,
        incoming: &JobAttrs,
    ) -> Option<JobAttrs> {
        match save_key(incoming) {
            SaveKey::ById => incoming.id.as_ref().and_then(|id| {
                jobs.get(id)
                    .filter(|row| row.name == incoming.name)
                    .cloned()
            }),
            SaveKey::Single => jobs
                .values()
                .find(|row| row.name == incoming.name && row.job_type == JobType::Single)
                .cloned(),
            SaveKey::Unique => incoming.unique.as_ref().and_then(|selector| {
                jobs.values()
                    .find(|row| {
                        row.name == incoming.name && unique_selector_matches(row, selector)
                    })
                    .cloned()
            }),
            SaveKey::Insert => None,
        }
    }
}

impl Default for MemoryJobRepository {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            fail_next: Mutex::new(None),
        }
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn connect(&self) -> Result<()> {
        self.maybe_fail("connect")?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_job_by_id(&self, id: &Id) -> Result<Option<JobAttrs>> {
        self.maybe_fail("get_job_by_id")?;
        Ok(self.guard(&self.jobs).get(id).cloned())
    }

    async fn query_jobs(&self, options: &QueryOptions) -> Result<JobPage> {
        self.maybe_fail("query_jobs")?;
        let now = Utc::now();
        let mut matching: Vec<JobWithState> = self
            .guard(&self.jobs)
            .values()
            .filter(|row| {
                options
                    .name
                    .as_ref()
                    .map_or(true, |name| &row.name == name)
            })
            .map(|row| JobWithState::derive(row.clone(), now))
            .filter(|row| options.state.map_or(true, |state| row.state == state))
            .collect();
        matching.sort_by(|a, b| claim_cmp(&a.attrs, &b.attrs));
        let total = matching.len();
        let jobs = matching
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(JobPage { jobs, total })
    }

    async fn get_jobs_overview(&self) -> Result<Vec<JobOverview>> {
        self.maybe_fail("get_jobs_overview")?;
        let now = Utc::now();
        let mut by_name: HashMap<String, JobOverview> = HashMap::new();
        for row in self.guard(&self.jobs).values() {
            let entry = by_name
                .entry(row.name.clone())
                .or_insert_with(|| JobOverview {
                    name: row.name.clone(),
                    ..Default::default()
                });
            entry.total += 1;
            if row.is_repeating() {
                entry.repeating += 1;
            }
            match row.compute_state(now) {
                ch_sched::JobState::Scheduled => entry.scheduled += 1,
                ch_sched::JobState::Queued => entry.queued += 1,
                ch_sched::JobState::Running => entry.running += 1,
                ch_sched::JobState::Completed => entry.completed += 1,
                ch_sched::JobState::Failed => entry.failed += 1,
            }
        }
        let mut overview: Vec<JobOverview> = by_name.into_values().collect();
        overview.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(overview)
    }

    async fn get_distinct_job_names(&self) -> Result<Vec<String>> {
        self.maybe_fail("get_distinct_job_names")?;
        let mut names: Vec<String> = self
            .guard(&self.jobs)
            .values()
            .map(|row| row.name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_queue_size(&self) -> Result<usize> {
        self.maybe_fail("get_queue_size")?;
        let now = Utc::now();
        Ok(self
            .guard(&self.jobs)
            .values()
            .filter(|row| {
                !row.disabled
                    && row.locked_at.is_none()
                    && row.next_run_at.map_or(false, |next| next <= now)
            })
            .count())
    }

    async fn save_job(&self, mut attrs: JobAttrs, options: &SaveOptions) -> Result<JobAttrs> {
        self.maybe_fail("save_job")?;
        attrs.last_modified_by = options.last_modified_by.clone();
        let now = Utc::now();
        let mut jobs = self.guard(&self.jobs);
        let existing = Self::find_existing(&jobs, &attrs);
        let resolution = resolve_save(existing.as_ref(), &attrs, now);
        match resolution.write {
            Some(mut write) => {
                let id = write.id.clone().unwrap_or_else(Id::new);
                write.id = Some(id.clone());
                jobs.insert(id, write.clone());
                Ok(write)
            }
            None => Ok(resolution.result),
        }
    }

    async fn save_job_state(&self, attrs: &JobAttrs, options: &SaveOptions) -> Result<()> {
        self.maybe_fail("save_job_state")?;
        let id = attrs
            .id
            .clone()
            .ok_or_else(|| Error::Repository("cannot save state without an id".to_string()))?;
        let mut jobs = self.guard(&self.jobs);
        let row = jobs
            .get_mut(&id)
            .filter(|row| row.name == attrs.name)
            .ok_or_else(|| Error::NotFound(format!("job {} ({})", id, attrs.name)))?;
        row.locked_at = attrs.locked_at;
        row.next_run_at = attrs.next_run_at;
        row.last_run_at = attrs.last_run_at;
        row.last_finished_at = attrs.last_finished_at;
        row.failed_at = attrs.failed_at;
        row.fail_reason = attrs.fail_reason.clone();
        row.fail_count = attrs.fail_count;
        row.progress = attrs.progress;
        row.last_modified_by = options
            .last_modified_by
            .clone()
            .or_else(|| row.last_modified_by.clone());
        Ok(())
    }

    async fn get_next_job_to_run(
        &self,
        name: &str,
        next_scan_at: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobAttrs>> {
        self.maybe_fail("get_next_job_to_run")?;
        let mut jobs = self.guard(&self.jobs);
        let best_id = jobs
            .values()
            .filter(|row| row.name == name && claimable(row, next_scan_at, lock_deadline))
            .min_by(|a, b| claim_cmp(a, b))
            .and_then(|row| row.id.clone());
        match best_id {
            Some(id) => {
                let row = jobs
                    .get_mut(&id)
                    .ok_or_else(|| Error::Repository("claimed row vanished".to_string()))?;
                row.locked_at = Some(now);
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    async fn lock_job(&self, attrs: &JobAttrs) -> Result<Option<JobAttrs>> {
        self.maybe_fail("lock_job")?;
        let Some(id) = attrs.id.clone() else {
            return Ok(None);
        };
        let mut jobs = self.guard(&self.jobs);
        match jobs.get_mut(&id) {
            Some(row) if row.locked_at.is_none() && row.next_run_at == attrs.next_run_at => {
                row.locked_at = Some(Utc::now());
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn unlock_job(&self, attrs: &JobAttrs) -> Result<()> {
        self.maybe_fail("unlock_job")?;
        if let Some(id) = &attrs.id {
            if let Some(row) = self.guard(&self.jobs).get_mut(id) {
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn unlock_jobs(&self, ids: &[Id]) -> Result<()> {
        self.maybe_fail("unlock_jobs")?;
        let mut jobs = self.guard(&self.jobs);
        for id in ids {
            if let Some(row) = jobs.get_mut(id) {
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn remove_jobs(&self, selector: &JobSelector) -> Result<u64> {
        self.maybe_fail("remove_jobs")?;
        if selector.is_empty() {
            return Ok(0);
        }
        let mut jobs = self.guard(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, row| !selector.matches(row));
        Ok((before - jobs.len()) as u64)
    }

    async fn disable_jobs(&self, selector: &JobSelector) -> Result<u64> {
        self.maybe_fail("disable_jobs")?;
        if selector.is_empty() {
            return Ok(0);
        }
        let mut affected = 0;
        for row in self.guard(&self.jobs).values_mut() {
            if selector.matches(row) {
                row.disabled = true;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn enable_jobs(&self, selector: &JobSelector) -> Result<u64> {
        self.maybe_fail("enable_jobs")?;
        if selector.is_empty() {
            return Ok(0);
        }
        let mut affected = 0;
        for row in self.guard(&self.jobs).values_mut() {
            if selector.matches(row) {
                row.disabled = false;
                affected += 1;
            }
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn attrs(name: &str) -> JobAttrs {
        JobAttrs::new(name, Value::Null)
    }

    fn opts() -> SaveOptions {
        SaveOptions {
            last_modified_by: Some("test-worker".to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_roundtrips() {
        let repo = MemoryJobRepository::new();
        let mut incoming = attrs("greet");
        incoming.data = json!({"who": "world"});
        incoming.next_run_at = Some(Utc::now());

        let saved = repo.save_job(incoming, &opts()).await.unwrap();
        let id = saved.id.clone().unwrap();
        let fetched = repo.get_job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "greet");
        assert_eq!(fetched.data, json!({"who": "world"}));
        assert_eq!(fetched.next_run_at, saved.next_run_at);
        assert_eq!(fetched.last_modified_by.as_deref(), Some("test-worker"));
    }

    #[tokio::test]
    async fn test_single_type_keeps_one_row() {
        let repo = MemoryJobRepository::new();
        for _ in 0..3 {
            let mut incoming = attrs("tick");
            incoming.job_type = JobType::Single;
            incoming.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
            repo.save_job(incoming, &opts()).await.unwrap();
        }
        assert_eq!(repo.all().len(), 1);
    }

    #[tokio::test]
    async fn test_unique_insert_only_preserves_first_save() {
        let repo = MemoryJobRepository::new();
        let first_run_at = Utc::now() + chrono::Duration::hours(1);

        for attempt in 0..2 {
            let mut incoming = attrs("order");
            incoming.data = json!({"id": "X"});
            incoming.unique = Some(json!({"data.id": "X"}));
            incoming.unique_opts = Some(ch_sched::UniqueOptions {
                insert_only: true,
                debounce: None,
            });
            incoming.next_run_at = Some(first_run_at + chrono::Duration::hours(attempt));
            repo.save_job(incoming, &opts()).await.unwrap();
        }

        let page = repo
            .query_jobs(&QueryOptions {
                name: Some("order".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.jobs[0].attrs.next_run_at, Some(first_run_at));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = MemoryJobRepository::new();
        let mut incoming = attrs("greet");
        incoming.next_run_at = Some(Utc::now());
        repo.save_job(incoming, &opts()).await.unwrap();

        let now = Utc::now();
        let next_scan = now + chrono::Duration::seconds(5);
        let deadline = now - chrono::Duration::minutes(10);

        let first = repo
            .get_next_job_to_run("greet", next_scan, deadline, now)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = repo
            .get_next_job_to_run("greet", next_scan, deadline, now)
            .await
            .unwrap();
        assert!(second.is_none(), "a locked job must not be claimed twice");
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimable() {
        let repo = MemoryJobRepository::new();
        let mut incoming = attrs("greet");
        incoming.next_run_at = Some(Utc::now() - chrono::Duration::minutes(20));
        incoming.locked_at = Some(Utc::now() - chrono::Duration::minutes(15));
        repo.insert_raw(incoming);

        let now = Utc::now();
        let reclaimed = repo
            .get_next_job_to_run(
                "greet",
                now + chrono::Duration::seconds(5),
                now - chrono::Duration::minutes(10),
                now,
            )
            .await
            .unwrap();
        assert!(reclaimed.is_some());
    }

    #[tokio::test]
    async fn test_claim_ranking_priority() {
        let repo = MemoryJobRepository::new();
        let due = Utc::now() - chrono::Duration::seconds(1);
        let mut low = attrs("greet");
        low.next_run_at = Some(due);
        low.priority = 0;
        let low = repo.insert_raw(low);
        let mut high = attrs("greet");
        high.next_run_at = Some(due);
        high.priority = 10;
        let high = repo.insert_raw(high);

        let now = Utc::now();
        let claimed = repo
            .get_next_job_to_run(
                "greet",
                now + chrono::Duration::seconds(5),
                now - chrono::Duration::minutes(10),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.id);
        assert_ne!(claimed.id, low.id);
    }

    #[tokio::test]
    async fn test_lock_job_requires_exact_next_run_at() {
        let repo = MemoryJobRepository::new();
        let run_at = Utc::now();
        let mut incoming = attrs("greet");
        incoming.next_run_at = Some(run_at);
        let stored = repo.insert_raw(incoming);

        let mut stale_probe = stored.clone();
        stale_probe.next_run_at = Some(run_at + chrono::Duration::seconds(1));
        assert!(repo.lock_job(&stale_probe).await.unwrap().is_none());

        let locked = repo.lock_job(&stored).await.unwrap();
        assert!(locked.is_some());
        // Second attempt loses the race.
        assert!(repo.lock_job(&stored).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_job_state_missing_row() {
        let repo = MemoryJobRepository::new();
        let mut ghost = attrs("greet");
        ghost.id = Some(Id::new());
        let result = repo.save_job_state(&ghost, &opts()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disable_enable_roundtrip() {
        let repo = MemoryJobRepository::new();
        let mut incoming = attrs("greet");
        incoming.next_run_at = Some(Utc::now());
        let stored = repo.insert_raw(incoming);
        let selector = JobSelector::by_id(stored.id.clone().unwrap());

        assert_eq!(repo.disable_jobs(&selector).await.unwrap(), 1);
        assert!(repo.all()[0].disabled);

        // Disabled rows are never claimed.
        let now = Utc::now();
        assert!(repo
            .get_next_job_to_run(
                "greet",
                now + chrono::Duration::seconds(5),
                now - chrono::Duration::minutes(10),
                now
            )
            .await
            .unwrap()
            .is_none());

        assert_eq!(repo.enable_jobs(&selector).await.unwrap(), 1);
        assert!(!repo.all()[0].disabled);
    }

    #[tokio::test]
    async fn test_empty_selector_is_noop() {
        let repo = MemoryJobRepository::new();
        repo.insert_raw(attrs("greet"));
        let empty = JobSelector::default();
        assert_eq!(repo.remove_jobs(&empty).await.unwrap(), 0);
        assert_eq!(repo.disable_jobs(&empty).await.unwrap(), 0);
        assert_eq!(repo.all().len(), 1);
    }

    #[tokio::test]
    async fn test_overview_counts() {
        let repo = MemoryJobRepository::new();
        let mut queued = attrs("greet");
        queued.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        repo.insert_raw(queued);
        let mut scheduled = attrs("greet");
        scheduled.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        scheduled.repeat_interval = Some("1 hour".to_string());
        repo.insert_raw(scheduled);

        let overview = repo.get_jobs_overview().await.unwrap();
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].name, "greet");
        assert_eq!(overview[0].total, 2);
        assert_eq!(overview[0].queued, 1);
        assert_eq!(overview[0].scheduled, 1);
        assert_eq!(overview[0].repeating, 1);
    }

    #[tokio::test]
    async fn test_queue_size() {
        let repo = MemoryJobRepository::new();
        let mut due = attrs("a");
        due.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        repo.insert_raw(due);
        let mut future = attrs("b");
        future.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        repo.insert_raw(future);

        assert_eq!(repo.get_queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let repo = MemoryJobRepository::new();
        repo.fail_next("get_queue_size");
        assert!(repo.get_queue_size().await.is_err());
        assert!(repo.get_queue_size().await.is_ok());
    }

    #[tokio::test]
    async fn test_unlock_clears_lock_regardless_of_next_run() {
        let repo = MemoryJobRepository::new();
        let mut terminal = attrs("greet");
        terminal.locked_at = Some(Utc::now());
        terminal.next_run_at = None;
        let stored = repo.insert_raw(terminal);

        repo.unlock_jobs(&[stored.id.clone().unwrap()]).await.unwrap();
        assert!(repo.all()[0].locked_at.is_none());
    }
}
