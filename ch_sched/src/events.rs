//! ABOUTME: Typed broadcast bus for scheduler lifecycle events
//! ABOUTME: Supports whole-stream and per-job-name subscriptions

use std::time::Duration;
use tokio::sync::broadcast;

use crate::job::JobAttrs;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Events emitted by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The scheduler finished starting
    Ready,
    /// A non-fatal error was captured
    Error(String),
    /// A job began executing
    Start(JobAttrs),
    /// A handler completed successfully
    Success(JobAttrs),
    /// A handler failed
    Fail { error: String, job: JobAttrs },
    /// A run finished, successfully or not
    Complete(JobAttrs),
    /// A failed job was rescheduled by its backoff strategy
    Retry {
        job: JobAttrs,
        attempt: u32,
        delay: Duration,
    },
    /// The backoff strategy declined to retry again
    RetryExhausted { error: String, job: JobAttrs },
}

impl SchedulerEvent {
    /// Name of the job this event concerns, if any
    pub fn job_name(&self) -> Option<&str> {
        match self {
            SchedulerEvent::Ready | SchedulerEvent::Error(_) => None,
            SchedulerEvent::Start(job)
            | SchedulerEvent::Success(job)
            | SchedulerEvent::Complete(job) => Some(&job.name),
            SchedulerEvent::Fail { job, .. }
            | SchedulerEvent::Retry { job, .. }
            | SchedulerEvent::RetryExhausted { job, .. } => Some(&job.name),
        }
    }
}

/// Broadcast bus carrying scheduler events to any number of subscribers.
///
/// Emission is fire-and-forget: a bus with no subscribers drops events, and
/// slow subscribers may observe lag.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers; returns the receiver count
    pub fn emit(&self, event: SchedulerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events for a single job name
    pub fn subscribe_job(&self, name: &str) -> JobEvents {
        JobEvents {
            name: name.to_string(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// A receiver filtered to a single job name.
///
/// Lagged stretches are skipped rather than surfaced; `None` means the bus
/// was dropped.
pub struct JobEvents {
    name: String,
    receiver: broadcast::Receiver<SchedulerEvent>,
}

impl JobEvents {
    pub async fn recv(&mut self) -> Option<SchedulerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.job_name() == Some(self.name.as_str()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
