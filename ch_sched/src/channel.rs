//! ABOUTME: Notification channel contract used to wake peer workers on save
//! ABOUTME: Includes the reconnection state machine wrapped around transports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ch_core::{Id, Result};

use crate::events::{EventBus, SchedulerEvent};
use crate::job::{JobAttrs, JobState};

/// Broadcast message published on every job save
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: Option<Id>,
    pub job_name: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    /// Identity of the publishing worker
    pub source: Option<String>,
}

impl JobNotification {
    pub fn for_job(attrs: &JobAttrs, source: Option<String>) -> Self {
        Self {
            job_id: attrs.id.clone(),
            job_name: attrs.name.clone(),
            next_run_at: attrs.next_run_at,
            priority: attrs.priority,
            timestamp: Utc::now(),
            source,
        }
    }
}

/// Optional state-change message for dashboards and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateNotification {
    pub job_id: Option<Id>,
    pub job_name: String,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

/// Connection lifecycle of a notification transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Publish/subscribe transport for job-save notifications.
///
/// Subscription hands out broadcast receivers, so subscribers survive
/// transport reconnects. Delivery is at-most-once per receiver; the
/// processor tolerates duplicates across workers.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, notification: &JobNotification) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<JobNotification>;

    fn state(&self) -> ChannelState;

    /// Optional state-event publishing; transports without it ignore calls
    async fn publish_state(&self, _notification: &JobStateNotification) -> Result<()> {
        Ok(())
    }

    fn subscribe_state(&self) -> Option<broadcast::Receiver<JobStateNotification>> {
        None
    }
}

/// Reconnection behavior for a wrapped transport
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate delay for a given attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            capped * (1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter))
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

struct ChannelShared {
    inner: Arc<dyn NotificationChannel>,
    policy: ReconnectPolicy,
    state: Mutex<ChannelState>,
    reconnecting: AtomicBool,
    events: EventBus,
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ChannelState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

/// Transport wrapper implementing the reconnection state machine.
///
/// `disconnected → connecting → connected → reconnecting → disconnected`.
/// A publish failure while connected triggers a background reconnect loop
/// with exponential backoff and jitter; exhaustion lands in `Disconnected`
/// and is reported on the event bus. Clones share the same connection
/// state.
#[derive(Clone)]
pub struct ReconnectingChannel {
    shared: Arc<ChannelShared>,
}

impl ReconnectingChannel {
    pub fn new(
        inner: Arc<dyn NotificationChannel>,
        policy: ReconnectPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                inner,
                policy,
                state: Mutex::new(ChannelState::Disconnected),
                reconnecting: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub async fn connect(&self) -> Result<()> {
        self.shared.set_state(ChannelState::Connecting);
        match self.shared.inner.connect().await {
            Ok(()) => {
                self.shared.set_state(ChannelState::Connected);
                debug!("Notification channel connected");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ChannelState::Disconnected);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.shared.set_state(ChannelState::Disconnected);
        self.shared.inner.disconnect().await
    }

    /// Subscribers are handed the transport's broadcast receiver and are
    /// preserved across reconnects
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.shared.inner.subscribe()
    }

    /// Publish, scheduling a reconnect on transport failure.
    ///
    /// The error is returned so callers can report it, but the channel
    /// itself recovers in the background.
    pub async fn publish(&self, notification: &JobNotification) -> Result<()> {
        match self.shared.inner.publish(notification).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, job = %notification.job_name, "Notification publish failed");
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    pub async fn publish_state(&self, notification: &JobStateNotification) -> Result<()> {
        match self.shared.inner.publish_state(notification).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    fn spawn_reconnect(&self) {
        if self.shared.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set_state(ChannelState::Reconnecting);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            for attempt in 0..shared.policy.max_attempts {
                tokio::time::sleep(shared.policy.delay_for_attempt(attempt)).await;
                match shared.inner.connect().await {
                    Ok(()) => {
                        shared.set_state(ChannelState::Connected);
                        shared.reconnecting.store(false, Ordering::SeqCst);
                        info!(attempt = attempt + 1, "Notification channel reconnected");
                        return;
                    }
                    Err(e) => {
                        debug!(
                            attempt = attempt + 1,
                            error = %e,
                            "Notification channel reconnect attempt failed"
                        );
                    }
                }
            }
            shared.set_state(ChannelState::Disconnected);
            shared.reconnecting.store(false, Ordering::SeqCst);
            shared.events.emit(SchedulerEvent::Error(format!(
                "notification channel gave up after {} reconnect attempts",
                shared.policy.max_attempts
            )));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Loopback transport whose connect can be scripted to fail
    struct FlakyChannel {
        sender: broadcast::Sender<JobNotification>,
        connect_failures: AtomicUsize,
        connected: AtomicBool,
    }

    impl FlakyChannel {
        fn new(connect_failures: usize) -> Self {
            let (sender, _) = broadcast::channel(16);
            Self {
                sender,
                connect_failures: AtomicUsize::new(connect_failures),
                connected: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl NotificationChannel for FlakyChannel {
        async fn connect(&self) -> Result<()> {
            if self
                .connect_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(ch_core::Error::Notification("connect refused".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, notification: &JobNotification) -> Result<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(ch_core::Error::Notification("not connected".to_string()));
            }
            let _ = self.sender.send(notification.clone());
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
            self.sender.subscribe()
        }

        fn state(&self) -> ChannelState {
            if self.connected.load(Ordering::SeqCst) {
                ChannelState::Connected
            } else {
                ChannelState::Disconnected
            }
        }
    }

    fn notification(name: &str) -> JobNotification {
        JobNotification {
            job_id: Some(Id::new()),
            job_name: name.to_string(),
            next_run_at: Some(Utc::now()),
            priority: 0,
            timestamp: Utc::now(),
            source: None,
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_reconnect_delay_growth_and_cap() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(400));
    }

    #[test]
    fn test_reconnect_delay_jitter_bounds() {
        let policy = ReconnectPolicy {
            jitter: 0.5,
            ..ReconnectPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_connect_transitions_to_connected() {
        let channel = ReconnectingChannel::new(
            Arc::new(FlakyChannel::new(0)),
            fast_policy(),
            EventBus::new(),
        );
        assert_eq!(channel.state(), ChannelState::Disconnected);
        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        channel.disconnect().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_failure_triggers_reconnect() {
        let transport = Arc::new(FlakyChannel::new(0));
        let channel =
            ReconnectingChannel::new(transport.clone(), fast_policy(), EventBus::new());
        channel.connect().await.unwrap();

        // Sever the transport behind the wrapper's back.
        transport.connected.store(false, Ordering::SeqCst);
        assert!(channel.publish(&notification("greet")).await.is_err());

        // The background loop reconnects within a few backoff periods.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while channel.state() != ChannelState::Connected {
            assert!(tokio::time::Instant::now() < deadline, "never reconnected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(channel.publish(&notification("greet")).await.is_ok());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_reports_error() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let transport = Arc::new(FlakyChannel::new(100));
        let channel = ReconnectingChannel::new(transport, fast_policy(), events);

        assert!(channel.publish(&notification("greet")).await.is_err());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no error event");
            if let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
            {
                if let SchedulerEvent::Error(message) = event {
                    assert!(message.contains("reconnect attempts"));
                    break;
                }
            }
        }
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribers_survive_reconnect() {
        let transport = Arc::new(FlakyChannel::new(0));
        let channel =
            ReconnectingChannel::new(transport.clone(), fast_policy(), EventBus::new());
        channel.connect().await.unwrap();
        let mut rx = channel.subscribe();

        transport.connected.store(false, Ordering::SeqCst);
        let _ = channel.publish(&notification("lost")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while channel.state() != ChannelState::Connected {
            assert!(tokio::time::Instant::now() < deadline, "never reconnected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        channel.publish(&notification("after")).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_name, "after");
    }
}
