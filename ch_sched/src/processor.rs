//! ABOUTME: The scheduler loop: periodic scan, notification wake, dispatch
//! ABOUTME: under concurrency gates, lease renewal, and completion bookkeeping

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ch_core::{Error, Id, Result};
use ch_interval::BackoffContext;

use crate::channel::JobNotification;
use crate::config::SchedulerConfig;
use crate::definition::Definition;
use crate::events::SchedulerEvent;
use crate::fork;
use crate::job::{compute_next_run_at, fail_attrs, Job, JobAttrs, JobState};
use crate::repository::{claim_cmp, JobSelector};
use crate::scheduler::{DrainOutcome, SchedulerContext};

/// A job that has been dispatched and is awaiting its handler
struct RunningTask {
    job: Job,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ProcState {
    /// Locked-but-not-yet-running jobs, ordered by `next_run_at` then priority
    queue: Vec<Job>,
    /// In-flight handlers keyed by job id
    running: HashMap<Id, RunningTask>,
    /// Every lock this process currently holds
    locked: HashSet<Id>,
}

enum RetryOutcome {
    Retry { attempt: u32, delay: std::time::Duration },
    Exhausted,
}

/// Drives claiming and execution for one scheduler instance.
///
/// All queue mutation happens on the main loop task; handler tasks only
/// remove their own entries on completion.
pub(crate) struct Processor {
    ctx: Arc<SchedulerContext>,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    state: Mutex<ProcState>,
    main: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub(crate) fn new(ctx: Arc<SchedulerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            state: Mutex::new(ProcState::default()),
            main: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) async fn start(this: &Arc<Self>) -> Result<()> {
        let notifications = this.ctx.subscribe_notifications().await;
        let handle = tokio::spawn(Self::main_loop(Arc::clone(this), notifications));
        *this.main.lock().await = Some(handle);
        Ok(())
    }

    /// Stop claiming, release every held lock, and leave in-flight handlers
    /// to finish on their own
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.main.lock().await.take() {
            let _ = handle.await;
        }
        let locked_ids: Vec<Id> = {
            let mut state = self.lock_state();
            state.queue.clear();
            state.locked.drain().collect()
        };
        if !locked_ids.is_empty() {
            if let Err(e) = self.ctx.repository.unlock_jobs(&locked_ids).await {
                warn!(error = %e, "Failed to unlock jobs during stop");
            }
        }
        self.ctx.definitions.reset_counters().await;
    }

    /// Stop claiming and await in-flight handlers, force-unlocking whatever
    /// remains after the timeout or signal
    pub(crate) async fn drain(
        &self,
        timeout: Option<std::time::Duration>,
        signal: Option<CancellationToken>,
    ) -> Result<DrainOutcome> {
        self.shutdown.cancel();
        if let Some(handle) = self.main.lock().await.take() {
            let _ = handle.await;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.lock_state();
            state
                .running
                .values_mut()
                .filter_map(|running| running.task.take())
                .collect()
        };
        let all_done = futures_util::future::join_all(tasks);
        let timed_out = tokio::select! {
            _ = all_done => false,
            _ = Self::sleep_or_forever(timeout) => true,
            _ = Self::cancelled_or_forever(signal) => true,
        };
        let running = self.lock_state().running.len();
        let locked_ids: Vec<Id> = {
            let mut state = self.lock_state();
            state.queue.clear();
            state.locked.drain().collect()
        };
        if !locked_ids.is_empty() {
            if let Err(e) = self.ctx.repository.unlock_jobs(&locked_ids).await {
                warn!(error = %e, "Failed to unlock jobs during drain");
            }
        }
        self.ctx.definitions.reset_counters().await;
        Ok(DrainOutcome { timed_out, running })
    }

    /// Trip the cooperative cancellation flag on tracked jobs matching the
    /// selector
    pub(crate) fn cancel_matching(&self, selector: &JobSelector) {
        let state = self.lock_state();
        for running in state.running.values() {
            if selector.matches(&running.job.attrs()) {
                running.job.cancellation().cancel();
            }
        }
        for job in &state.queue {
            if selector.matches(&job.attrs()) {
                job.cancellation().cancel();
            }
        }
    }

    async fn main_loop(
        this: Arc<Self>,
        mut notifications: Option<broadcast::Receiver<JobNotification>>,
    ) {
        let mut tick = tokio::time::interval(this.ctx.config().process_every());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let pending_delay = this.next_pending_delay();
            tokio::select! {
                _ = this.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    this.run_tick().await;
                }
                notification = Self::recv_notification(&mut notifications) => {
                    match notification {
                        Some(n) => this.on_notification(n).await,
                        None => notifications = None,
                    }
                }
                _ = this.wake.notified() => {}
                _ = Self::sleep_or_forever(pending_delay) => {}
            }
            if this.shutdown.is_cancelled() {
                break;
            }
            Self::dispatch(&this).await;
        }
    }

    /// One scan: claim every due (or stale-locked) job per name until the
    /// lock limits fill.
    ///
    /// A repository error aborts the scan; the next tick retries.
    async fn run_tick(&self) {
        let config = self.ctx.config();
        let now = Utc::now();
        let next_scan_at = now + chrono::Duration::milliseconds(config.process_every_ms as i64);

        for name in self.ctx.definitions.names().await {
            let Some(definition) = self.ctx.definitions.get(&name).await else {
                continue;
            };
            loop {
                if !self.may_lock_more(&definition, &config) {
                    break;
                }
                let lock_deadline = now - definition.lock_lifetime();
                match self
                    .ctx
                    .repository
                    .get_next_job_to_run(&name, next_scan_at, lock_deadline, now)
                    .await
                {
                    Ok(Some(attrs)) => {
                        debug!(job = %name, id = ?attrs.id, "Claimed job");
                        self.track_locked(attrs, &definition);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(job = %name, error = %e, "Tick aborted: claim failed");
                        self.ctx.events.emit(SchedulerEvent::Error(format!(
                            "claim failed for '{}': {}",
                            name, e
                        )));
                        return;
                    }
                }
            }
        }
    }

    /// Start queued jobs while the head is due and the gates allow it
    async fn dispatch(this: &Arc<Self>) {
        loop {
            let now = Utc::now();
            let head_name = {
                let state = this.lock_state();
                match state.queue.first() {
                    Some(job) => {
                        let attrs = job.attrs();
                        if attrs.next_run_at.map_or(true, |next| next <= now) {
                            Some(attrs.name)
                        } else {
                            // Not yet due; the bounded timer in the main loop
                            // covers it.
                            None
                        }
                    }
                    None => None,
                }
            };
            let Some(name) = head_name else { break };

            let Some(definition) = this.ctx.definitions.get(&name).await else {
                let job = {
                    let mut state = this.lock_state();
                    state.queue.remove(0)
                };
                let attrs = job.attrs();
                warn!(job = %name, "Queued job has no registered handler");
                this.ctx.events.emit(SchedulerEvent::Error(
                    Error::DefinitionMissing(name.clone()).to_string(),
                ));
                if let Some(id) = &attrs.id {
                    this.lock_state().locked.remove(id);
                }
                if let Err(e) = this.ctx.repository.unlock_job(&attrs).await {
                    warn!(job = %name, error = %e, "Failed to unlock undefined job");
                }
                continue;
            };

            let config = this.ctx.config();
            let permitted = {
                let state = this.lock_state();
                definition.running_count() < definition.concurrency
                    && state.running.len() < config.max_concurrency
            };
            if !permitted {
                break;
            }

            let job = {
                let mut state = this.lock_state();
                state.queue.remove(0)
            };
            let attrs = job.with_attrs(|a| {
                a.last_run_at = Some(Utc::now());
                a.clone()
            });
            let Some(id) = attrs.id.clone() else {
                continue;
            };

            definition.running.fetch_add(1, Ordering::SeqCst);
            this.lock_state().running.insert(
                id.clone(),
                RunningTask {
                    job: job.clone(),
                    task: None,
                },
            );
            this.ctx
                .publish_state_notification(&attrs, JobState::Running)
                .await;
            this.ctx.events.emit(SchedulerEvent::Start(attrs));

            let task_definition = Arc::clone(&definition);
            let handle = tokio::spawn(Self::run_job(Arc::clone(this), job, task_definition));
            if let Some(running) = this.lock_state().running.get_mut(&id) {
                running.task = Some(handle);
            }
        }
    }

    async fn run_job(this: Arc<Self>, job: Job, definition: Arc<Definition>) {
        let attrs = job.attrs();
        let config = this.ctx.config();

        let lease_stop = CancellationToken::new();
        let renewal = tokio::spawn(Self::renew_lease(
            Arc::clone(&this.ctx),
            job.clone(),
            definition.lock_lifetime_ms,
            lease_stop.clone(),
        ));

        let result = if definition.fork || attrs.fork {
            match (&config.fork_helper, &attrs.id) {
                (Some(helper), Some(id)) => {
                    fork::run_forked_job(helper, &attrs.name, id, &job.cancellation()).await
                }
                (None, _) => Err(Error::Config(
                    "fork mode requires a configured fork_helper".to_string(),
                )),
                (_, None) => Err(Error::Config("cannot fork an unsaved job".to_string())),
            }
        } else {
            let handler = definition.handler.clone();
            let handler_job = job.clone();
            match tokio::spawn(async move { (handler)(handler_job).await }).await {
                Ok(result) => result,
                Err(join_error) => {
                    Err(Error::Handler(format!("handler panicked: {}", join_error)))
                }
            }
        };

        lease_stop.cancel();
        let _ = renewal.await;
        this.complete(job, definition, result).await;
    }

    /// Refresh `locked_at` at 80% of the lease so a healthy handler never
    /// loses its claim
    async fn renew_lease(
        ctx: Arc<SchedulerContext>,
        job: Job,
        lock_lifetime_ms: u64,
        stop: CancellationToken,
    ) {
        let period = std::time::Duration::from_millis((lock_lifetime_ms * 4 / 5).max(1));
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            let snapshot = job.with_attrs(|a| {
                a.locked_at = Some(Utc::now());
                a.clone()
            });
            let options = ctx.save_options();
            match ctx.repository.save_job_state(&snapshot, &options).await {
                Ok(()) => debug!(job = %snapshot.name, "Renewed job lease"),
                Err(e) => warn!(job = %snapshot.name, error = %e, "Failed to renew job lease"),
            }
        }
    }

    async fn complete(&self, job: Job, definition: Arc<Definition>, result: Result<()>) {
        let now = Utc::now();
        let error_text = result.err().map(|e| e.to_string());
        let mut retry: Option<RetryOutcome> = None;

        job.with_attrs(|a| {
            a.last_finished_at = Some(now);
            if let Some(error) = &error_text {
                fail_attrs(a, error.clone(), now);
            } else if a.fail_count > 0 && a.is_repeating() {
                // The next successful iteration of a recurring job clears
                // failure bookkeeping.
                a.fail_count = 0;
                a.fail_reason = None;
            }

            if a.is_repeating() {
                compute_next_run_at(a, now);
            } else if error_text.is_some() {
                if let Some(backoff) = &definition.backoff {
                    let attempt = a.fail_count;
                    let last_delay = if attempt > 1 {
                        backoff.next_delay(&BackoffContext {
                            attempt: attempt - 1,
                            error: None,
                            last_delay: None,
                        })
                    } else {
                        None
                    };
                    let context = BackoffContext {
                        attempt,
                        error: a.fail_reason.clone(),
                        last_delay,
                    };
                    match backoff.next_delay(&context) {
                        Some(delay) => {
                            let delta = chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                            a.next_run_at = Some(now + delta);
                            retry = Some(RetryOutcome::Retry { attempt, delay });
                        }
                        None => {
                            a.next_run_at = None;
                            retry = Some(RetryOutcome::Exhausted);
                        }
                    }
                } else {
                    a.next_run_at = None;
                }
            } else {
                a.next_run_at = None;
            }
            a.locked_at = None;
        });

        let snapshot = job.attrs();
        let options = self.ctx.save_options();
        if let Err(e) = self.ctx.repository.save_job_state(&snapshot, &options).await {
            // At-least-once: the lease lapses and another worker reclaims.
            warn!(job = %snapshot.name, error = %e, "Failed to persist completion");
            self.ctx.events.emit(SchedulerEvent::Error(format!(
                "completion save failed for '{}': {}",
                snapshot.name, e
            )));
        }

        {
            let mut state = self.lock_state();
            if let Some(id) = &snapshot.id {
                state.running.remove(id);
                state.locked.remove(id);
            }
        }
        definition.dec_running();
        definition.dec_locked();

        match retry {
            Some(RetryOutcome::Retry { attempt, delay }) => {
                self.ctx.events.emit(SchedulerEvent::Retry {
                    job: snapshot.clone(),
                    attempt,
                    delay,
                });
            }
            Some(RetryOutcome::Exhausted) => {
                self.ctx.events.emit(SchedulerEvent::RetryExhausted {
                    error: error_text.clone().unwrap_or_default(),
                    job: snapshot.clone(),
                });
            }
            None => {}
        }
        match &error_text {
            None => {
                self.ctx
                    .events
                    .emit(SchedulerEvent::Success(snapshot.clone()))
            }
            Some(error) => self.ctx.events.emit(SchedulerEvent::Fail {
                error: error.clone(),
                job: snapshot.clone(),
            }),
        };
        self.ctx
            .publish_state_notification(&snapshot, snapshot.compute_state(Utc::now()))
            .await;
        self.ctx.events.emit(SchedulerEvent::Complete(snapshot));
        self.wake.notify_one();
    }

    /// A save notification from a peer (or ourselves): attempt a targeted
    /// claim when the job is due soon and this process has room.
    ///
    /// Duplicate deliveries are harmless; a losing `lock_job` returns `None`.
    async fn on_notification(&self, notification: JobNotification) {
        let now = Utc::now();
        let config = self.ctx.config();
        let Some(next_run_at) = notification.next_run_at else {
            return;
        };
        if next_run_at > now + chrono::Duration::milliseconds(config.process_every_ms as i64) {
            return;
        }
        let Some(definition) = self.ctx.definitions.get(&notification.job_name).await else {
            debug!(job = %notification.job_name, "Notification for undefined job, ignoring");
            return;
        };
        if !self.may_lock_more(&definition, &config) {
            return;
        }
        let Some(id) = notification.job_id.clone() else {
            return;
        };
        {
            let state = self.lock_state();
            if state.locked.contains(&id) || state.running.contains_key(&id) {
                return;
            }
        }

        let mut probe = JobAttrs::new(&notification.job_name, serde_json::Value::Null);
        probe.id = Some(id);
        probe.next_run_at = Some(next_run_at);
        probe.priority = notification.priority;

        match self.ctx.repository.lock_job(&probe).await {
            Ok(Some(attrs)) => {
                debug!(job = %notification.job_name, "Claimed job from notification");
                self.track_locked(attrs, &definition);
            }
            Ok(None) => {
                debug!(job = %notification.job_name, "Lost notification claim race");
            }
            Err(e) => {
                warn!(job = %notification.job_name, error = %e, "Notification claim failed");
                self.ctx.events.emit(SchedulerEvent::Error(format!(
                    "notification claim failed for '{}': {}",
                    notification.job_name, e
                )));
            }
        }
    }

    fn track_locked(&self, attrs: JobAttrs, definition: &Arc<Definition>) {
        let Some(id) = attrs.id.clone() else {
            warn!(job = %attrs.name, "Claimed job without an id, skipping");
            return;
        };
        let job = Job::new(attrs, Arc::clone(&self.ctx));
        let key = job.attrs();
        let mut state = self.lock_state();
        if !state.locked.insert(id) {
            return;
        }
        let index = state
            .queue
            .binary_search_by(|queued| claim_cmp(&queued.attrs(), &key))
            .unwrap_or_else(|i| i);
        state.queue.insert(index, job);
        definition.locked.fetch_add(1, Ordering::SeqCst);
    }

    fn may_lock_more(&self, definition: &Definition, config: &SchedulerConfig) -> bool {
        if config.lock_limit > 0 && self.lock_state().locked.len() >= config.lock_limit {
            return false;
        }
        !(definition.lock_limit > 0 && definition.locked_count() >= definition.lock_limit)
    }

    fn next_pending_delay(&self) -> Option<std::time::Duration> {
        let head = {
            let state = self.lock_state();
            state.queue.first().map(|job| job.attrs().next_run_at)
        };
        head.flatten()
            .and_then(|at| (at - Utc::now()).to_std().ok())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ProcState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn recv_notification(
        rx: &mut Option<broadcast::Receiver<JobNotification>>,
    ) -> Option<JobNotification> {
        match rx {
            Some(receiver) => loop {
                match receiver.recv().await {
                    Ok(notification) => return Some(notification),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notification subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            None => std::future::pending().await,
        }
    }

    async fn sleep_or_forever(duration: Option<std::time::Duration>) {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }

    async fn cancelled_or_forever(token: Option<CancellationToken>) {
        match token {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}
