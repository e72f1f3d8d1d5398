//! ABOUTME: Loopback notification channel for tests
//! ABOUTME: Scriptable connect and publish failures to exercise reconnection

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use ch_core::{Error, Result};
use ch_sched::{ChannelState, JobNotification, JobStateNotification, NotificationChannel};

/// In-process broadcast transport.
///
/// Share one instance between several schedulers to simulate a real
/// notification fabric: every subscriber sees every publish.
pub struct MemoryChannel {
    sender: broadcast::Sender<JobNotification>,
    state_sender: broadcast::Sender<JobStateNotification>,
    connected: AtomicBool,
    fail_connects: AtomicUsize,
    fail_publishes: AtomicUsize,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(256);
        let (state_sender, _) = broadcast::channel(256);
        Arc::new(Self {
            sender,
            state_sender,
            connected: AtomicBool::new(false),
            fail_connects: AtomicUsize::new(0),
            fail_publishes: AtomicUsize::new(0),
        })
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_connects(&self, count: usize) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` publishes fail
    pub fn fail_publishes(&self, count: usize) {
        self.fail_publishes.store(count, Ordering::SeqCst);
    }

    fn consume(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    async fn connect(&self) -> Result<()> {
        if Self::consume(&self.fail_connects) {
            return Err(Error::Notification("scripted connect failure".to_string()));
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
            return Err(Error::Notification("channel not connected".to_string()));
        }
        if Self::consume(&self.fail_publishes) {
            return Err(Error::Notification("scripted publish failure".to_string()));
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

    async fn publish_state(&self, notification: &JobStateNotification) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Notification("channel not connected".to_string()));
        }
        let _ = self.state_sender.send(notification.clone());
        Ok(())
    }

    fn subscribe_state(&self) -> Option<broadcast::Receiver<JobStateNotification>> {
        Some(self.state_sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ch_sched::JobAttrs;
    use serde_json::Value;

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let channel = MemoryChannel::new();
        let notification =
            JobNotification::for_job(&JobAttrs::new("greet", Value::Null), None);
        assert!(channel.publish(&notification).await.is_err());
        channel.connect().await.unwrap();
        assert!(channel.publish(&notification).await.is_ok());
    }

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let channel = MemoryChannel::new();
        channel.connect().await.unwrap();
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();

        let notification =
            JobNotification::for_job(&JobAttrs::new("greet", Value::Null), None);
        channel.publish(&notification).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().job_name, "greet");
        assert_eq!(rx2.recv().await.unwrap().job_name, "greet");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let channel = MemoryChannel::new();
        channel.fail_connects(1);
        assert!(channel.connect().await.is_err());
        assert!(channel.connect().await.is_ok());

        channel.fail_publishes(1);
        let notification =
            JobNotification::for_job(&JobAttrs::new("greet", Value::Null), None);
        assert!(channel.publish(&notification).await.is_err());
        assert!(channel.publish(&notification).await.is_ok());
    }
}
