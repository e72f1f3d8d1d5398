//! ABOUTME: Public scheduler facade: configuration, definitions, scheduling
//! ABOUTME: verbs, lifecycle, the event bus, and forked-worker support

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ch_core::{parse_duration_ms, Error, Id, Result};

use crate::channel::{
    JobNotification, JobStateNotification, NotificationChannel, ReconnectPolicy,
    ReconnectingChannel,
};
use crate::config::SchedulerConfig;
use crate::definition::{DefineOptions, DefinitionRegistry, JobHandler};
use crate::events::{EventBus, JobEvents, SchedulerEvent};
use crate::job::{Job, JobAttrs, JobState, JobType, RepeatOptions, When};
use crate::processor::Processor;
use crate::repository::{
    JobOverview, JobPage, JobRepository, JobSelector, QueryOptions, SaveOptions,
};

/// Shared runtime handed to jobs and the processor
pub(crate) struct SchedulerContext {
    pub(crate) repository: Arc<dyn JobRepository>,
    channel: std::sync::RwLock<Option<ReconnectingChannel>>,
    pub(crate) definitions: DefinitionRegistry,
    pub(crate) events: EventBus,
    config: std::sync::RwLock<SchedulerConfig>,
    pub(crate) instance_name: String,
}

impl SchedulerContext {
    pub(crate) fn config(&self) -> SchedulerConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_process_every(&self, ms: u64) {
        self.config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .process_every_ms = ms;
    }

    pub(crate) fn channel_handle(&self) -> Option<ReconnectingChannel> {
        self.channel
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_channel(&self, channel: ReconnectingChannel) {
        *self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(channel);
    }

    pub(crate) fn save_options(&self) -> SaveOptions {
        SaveOptions {
            last_modified_by: Some(self.instance_name.clone()),
        }
    }

    pub(crate) async fn subscribe_notifications(
        &self,
    ) -> Option<broadcast::Receiver<JobNotification>> {
        self.channel_handle().map(|channel| channel.subscribe())
    }

    /// Best-effort publish: failures surface as `Error` events, never to the
    /// saving caller
    pub(crate) async fn publish_notification(&self, notification: JobNotification) {
        if let Some(channel) = self.channel_handle() {
            if let Err(e) = channel.publish(&notification).await {
                self.events.emit(SchedulerEvent::Error(format!(
                    "notification publish failed for '{}': {}",
                    notification.job_name, e
                )));
            }
        }
    }

    /// Optional state broadcast for transports that carry it; failures are
    /// logged, not surfaced
    pub(crate) async fn publish_state_notification(&self, attrs: &JobAttrs, state: JobState) {
        if let Some(channel) = self.channel_handle() {
            let notification = JobStateNotification {
                job_id: attrs.id.clone(),
                job_name: attrs.name.clone(),
                state,
                timestamp: chrono::Utc::now(),
                source: Some(self.instance_name.clone()),
            };
            if let Err(e) = channel.publish_state(&notification).await {
                warn!(job = %attrs.name, error = %e, "State notification publish failed");
            }
        }
    }

    pub(crate) async fn lock_lifetime_for(&self, name: &str) -> chrono::Duration {
        match self.definitions.get(name).await {
            Some(definition) => definition.lock_lifetime(),
            None => self.config().default_lock_lifetime(),
        }
    }
}

/// Options for the `every` scheduling verb
#[derive(Debug, Clone, Default)]
pub struct EveryOptions {
    pub timezone: Option<String>,
    /// Skip the run that would fire immediately, starting with the next
    /// interval occurrence
    pub skip_immediate: bool,
    /// Execute out-of-process
    pub fork_mode: bool,
}

/// Options for `drain`
#[derive(Debug, Clone, Default)]
pub struct DrainOptions {
    pub timeout: Option<std::time::Duration>,
    pub signal: Option<CancellationToken>,
}

/// Result of draining in-flight work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOutcome {
    pub timed_out: bool,
    /// Handlers still running when the drain gave up
    pub running: usize,
}

/// The engine entry point.
///
/// A scheduler owns one processor loop, an optional notification channel,
/// and an event bus. Jobs are persisted through the repository and claimed
/// under lease-based locks, so any number of scheduler processes may share
/// one backing store.
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
    processor: Arc<Processor>,
    started: AtomicBool,
    stopped: AtomicBool,
    owns_repository: AtomicBool,
}

impl Scheduler {
    pub fn new(repository: Arc<dyn JobRepository>, config: SchedulerConfig) -> Result<Self> {
        let config = config.validated()?;
        let instance_name = config.name.clone();
        let ctx = Arc::new(SchedulerContext {
            repository,
            channel: std::sync::RwLock::new(None),
            definitions: DefinitionRegistry::new(),
            events: EventBus::new(),
            config: std::sync::RwLock::new(config),
            instance_name,
        });
        let processor = Processor::new(Arc::clone(&ctx));
        Ok(Self {
            ctx,
            processor,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            owns_repository: AtomicBool::new(false),
        })
    }

    pub fn with_defaults(repository: Arc<dyn JobRepository>) -> Result<Self> {
        Self::new(repository, SchedulerConfig::default())
    }

    /// Close the repository connection on stop/drain (for connections the
    /// scheduler was handed exclusive ownership of)
    pub fn set_owns_repository(&self, owns: bool) {
        self.owns_repository.store(owns, Ordering::SeqCst);
    }

    /// Install a notification channel, wrapped with reconnection handling.
    ///
    /// Rejected after `start`.
    pub fn notify_via(&self, channel: Arc<dyn NotificationChannel>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(Error::Config(
                "cannot change the notification channel after start".to_string(),
            ));
        }
        let wrapped = ReconnectingChannel::new(
            channel,
            ReconnectPolicy::default(),
            self.ctx.events.clone(),
        );
        self.ctx.set_channel(wrapped);
        Ok(())
    }

    /// Change the poll period ("5 seconds" or milliseconds). Rejected after
    /// `start`.
    pub fn process_every(&self, every: &str) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(Error::Config(
                "cannot change process_every after start".to_string(),
            ));
        }
        let ms = parse_duration_ms(every)?;
        if ms == 0 {
            return Err(Error::Config("process_every must be positive".to_string()));
        }
        self.ctx.set_process_every(ms);
        Ok(())
    }

    /// Register (or replace) the handler for a job name
    pub async fn define<F, Fut>(&self, name: &str, options: DefineOptions, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| Box::pin(handler(job)));
        let config = self.ctx.config();
        self.ctx
            .definitions
            .define(name, options, handler, &config)
            .await;
    }

    /// Build an unsaved job record
    pub async fn create(&self, name: &str, data: Value) -> Job {
        let mut attrs = JobAttrs::new(name, data);
        if let Some(definition) = self.ctx.definitions.get(name).await {
            attrs.priority = definition.priority;
        }
        Job::new(attrs, Arc::clone(&self.ctx))
    }

    /// Save a job that runs as soon as a worker picks it up
    pub async fn now(&self, name: &str, data: Value) -> Result<Job> {
        let job = self.create(name, data).await;
        job.schedule(When::At(chrono::Utc::now()))?;
        job.save().await?;
        Ok(job)
    }

    /// Save a one-shot job for a future time (`Date` or human string)
    pub async fn schedule(&self, when: impl Into<When>, name: &str, data: Value) -> Result<Job> {
        let job = self.create(name, data).await;
        job.schedule(when)?;
        job.save().await?;
        Ok(job)
    }

    /// Save the recurring single job for a name.
    ///
    /// `every` jobs are `type = single`: one persisted row per name, no
    /// matter how many times this is called.
    pub async fn every(
        &self,
        interval: &str,
        name: &str,
        data: Value,
        options: EveryOptions,
    ) -> Result<Job> {
        let job = self.create(name, data).await;
        job.with_attrs(|a| a.job_type = JobType::Single);
        if options.fork_mode {
            job.fork_mode(true);
        }
        job.repeat_every(
            interval,
            RepeatOptions {
                timezone: options.timezone.clone(),
                skip_immediate: options.skip_immediate,
            },
        )?;
        job.save().await?;
        Ok(job)
    }

    /// Remove matching jobs, cancelling any that are currently tracked
    pub async fn cancel(&self, selector: &JobSelector) -> Result<u64> {
        if selector.is_empty() {
            return Ok(0);
        }
        self.processor.cancel_matching(selector);
        self.ctx.repository.remove_jobs(selector).await
    }

    pub async fn disable(&self, selector: &JobSelector) -> Result<u64> {
        self.ctx.repository.disable_jobs(selector).await
    }

    pub async fn enable(&self, selector: &JobSelector) -> Result<u64> {
        self.ctx.repository.enable_jobs(selector).await
    }

    /// Remove persisted jobs whose name has no registered definition
    pub async fn purge(&self) -> Result<u64> {
        let persisted = self.ctx.repository.get_distinct_job_names().await?;
        let mut undefined = Vec::new();
        for name in persisted {
            if !self.ctx.definitions.contains(&name).await {
                undefined.push(name);
            }
        }
        if undefined.is_empty() {
            return Ok(0);
        }
        info!(names = ?undefined, "Purging jobs with no registered definition");
        self.ctx
            .repository
            .remove_jobs(&JobSelector::by_names(undefined))
            .await
    }

    /// Connect and begin processing
    pub async fn start(&self) -> Result<()> {
        if self.ctx.config().forked_worker {
            return Err(Error::Config(
                "forked workers do not run the processor; use run_forked_job".to_string(),
            ));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Config(
                "scheduler cannot be restarted after stop".to_string(),
            ));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ctx.repository.connect().await?;
        if let Some(channel) = self.ctx.channel_handle() {
            if let Err(e) = channel.connect().await {
                warn!(error = %e, "Notification channel connect failed; polling only");
                self.ctx.events.emit(SchedulerEvent::Error(format!(
                    "notification channel connect failed: {}",
                    e
                )));
            }
        }
        Processor::start(&self.processor).await?;
        info!(instance = %self.ctx.instance_name, "Scheduler started");
        self.ctx.events.emit(SchedulerEvent::Ready);
        Ok(())
    }

    /// Stop immediately: release held locks so peers can reclaim, leaving
    /// in-flight handlers to finish on their own
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.processor.stop().await;
        self.disconnect_io().await;
        info!(instance = %self.ctx.instance_name, "Scheduler stopped");
        Ok(())
    }

    /// Stop claiming and wait for in-flight handlers to finish naturally
    pub async fn drain(&self, options: DrainOptions) -> Result<DrainOutcome> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(DrainOutcome {
                timed_out: false,
                running: 0,
            });
        }
        self.stopped.store(true, Ordering::SeqCst);
        let outcome = self
            .processor
            .drain(options.timeout, options.signal)
            .await?;
        self.disconnect_io().await;
        info!(
            instance = %self.ctx.instance_name,
            timed_out = outcome.timed_out,
            running = outcome.running,
            "Scheduler drained"
        );
        Ok(outcome)
    }

    /// The scheduler's event bus
    pub fn events(&self) -> EventBus {
        self.ctx.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.ctx.events.subscribe()
    }

    pub fn subscribe_job(&self, name: &str) -> JobEvents {
        self.ctx.events.subscribe_job(name)
    }

    /// Execute one already-claimed job inside a forked child process.
    ///
    /// The parent holds and renews the lease; the child reports through its
    /// exit status.
    pub async fn run_forked_job(&self, name: &str, id: &Id) -> Result<()> {
        let attrs = self
            .ctx
            .repository
            .get_job_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        let definition = self
            .ctx
            .definitions
            .get(name)
            .await
            .ok_or_else(|| Error::DefinitionMissing(name.to_string()))?;
        let job = Job::new(attrs, Arc::clone(&self.ctx));
        (definition.handler)(job).await
    }

    pub async fn get_job_by_id(&self, id: &Id) -> Result<Option<JobAttrs>> {
        self.ctx.repository.get_job_by_id(id).await
    }

    pub async fn query_jobs(&self, options: &QueryOptions) -> Result<JobPage> {
        self.ctx.repository.query_jobs(options).await
    }

    pub async fn get_jobs_overview(&self) -> Result<Vec<JobOverview>> {
        self.ctx.repository.get_jobs_overview().await
    }

    pub async fn get_queue_size(&self) -> Result<usize> {
        self.ctx.repository.get_queue_size().await
    }

    async fn disconnect_io(&self) {
        if let Some(channel) = self.ctx.channel_handle() {
            if let Err(e) = channel.disconnect().await {
                warn!(error = %e, "Failed to disconnect notification channel");
            }
        }
        if self.owns_repository.load(Ordering::SeqCst) {
            if let Err(e) = self.ctx.repository.disconnect().await {
                warn!(error = %e, "Failed to disconnect repository");
            }
        }
    }
}
