//! ABOUTME: Event-collection helpers for asserting on scheduler behavior
//! ABOUTME: Buffers a bus subscription and polls for expected sequences

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use ch_sched::{EventBus, SchedulerEvent};

/// Buffers every event from a bus for later assertions
pub struct EventCollector {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
    task: JoinHandle<()>,
}

impl EventCollector {
    pub fn attach(bus: &EventBus) -> Self {
        let events: Arc<Mutex<Vec<SchedulerEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut receiver = bus.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => sink
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { events, task }
    }

    /// Snapshot of everything received so far
    pub fn snapshot(&self) -> Vec<SchedulerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, predicate: impl Fn(&SchedulerEvent) -> bool) -> usize {
        self.snapshot().iter().filter(|e| predicate(e)).count()
    }

    /// Poll until the collected events satisfy the predicate; false on
    /// timeout
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&[SchedulerEvent]) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.snapshot()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for EventCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}
