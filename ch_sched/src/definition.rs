//! ABOUTME: Registry mapping job names to handlers and per-name options
//! ABOUTME: The authoritative source of concurrency and lease settings

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use ch_core::Result;
use ch_interval::Backoff;
use futures_util::future::BoxFuture;

use crate::config::SchedulerConfig;
use crate::job::Job;

/// Future produced by a job handler
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Type-erased job handler
pub type JobHandler = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

/// Per-name options accepted by `define`
#[derive(Clone, Default)]
pub struct DefineOptions {
    /// Max simultaneous executions of this name in the process
    pub concurrency: Option<usize>,
    /// Max simultaneous locks held; 0 = unbounded
    pub lock_limit: Option<usize>,
    /// Lease duration in milliseconds
    pub lock_lifetime_ms: Option<u64>,
    /// Default priority for jobs of this name
    pub priority: Option<i32>,
    /// Retry policy evaluated after failures
    pub backoff: Option<Backoff>,
    /// Execute out-of-process
    pub fork: bool,
}

impl std::fmt::Debug for DefineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefineOptions")
            .field("concurrency", &self.concurrency)
            .field("lock_limit", &self.lock_limit)
            .field("lock_lifetime_ms", &self.lock_lifetime_ms)
            .field("priority", &self.priority)
            .field("backoff", &self.backoff.is_some())
            .field("fork", &self.fork)
            .finish()
    }
}

/// A registered job definition with live execution counters
pub struct Definition {
    pub name: String,
    pub(crate) handler: JobHandler,
    pub concurrency: usize,
    pub lock_limit: usize,
    pub lock_lifetime_ms: u64,
    pub priority: i32,
    pub backoff: Option<Backoff>,
    pub fork: bool,
    pub(crate) running: AtomicUsize,
    pub(crate) locked: AtomicUsize,
}

impl Definition {
    /// Lease duration as a chrono duration
    pub fn lock_lifetime(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_lifetime_ms as i64)
    }

    /// Jobs of this name currently executing in this process
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Locks currently held for this name by this process
    pub fn locked_count(&self) -> usize {
        self.locked.load(Ordering::SeqCst)
    }

    pub(crate) fn dec_running(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub(crate) fn dec_locked(&self) {
        let _ = self
            .locked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("lock_limit", &self.lock_limit)
            .field("lock_lifetime_ms", &self.lock_lifetime_ms)
            .field("running", &self.running_count())
            .field("locked", &self.locked_count())
            .finish()
    }
}

/// Name-indexed set of definitions
#[derive(Default)]
pub(crate) struct DefinitionRegistry {
    inner: RwLock<HashMap<String, Arc<Definition>>>,
}

impl DefinitionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Upsert a definition; redefinition overwrites, resetting counters
    pub(crate) async fn define(
        &self,
        name: &str,
        options: DefineOptions,
        handler: JobHandler,
        config: &SchedulerConfig,
    ) {
        let definition = Arc::new(Definition {
            name: name.to_string(),
            handler,
            concurrency: options.concurrency.unwrap_or(config.default_concurrency),
            lock_limit: options.lock_limit.unwrap_or(config.default_lock_limit),
            lock_lifetime_ms: options
                .lock_lifetime_ms
                .unwrap_or(config.default_lock_lifetime_ms),
            priority: options.priority.unwrap_or(0),
            backoff: options.backoff,
            fork: options.fork,
            running: AtomicUsize::new(0),
            locked: AtomicUsize::new(0),
        });
        let mut inner = self.inner.write().await;
        if inner.insert(name.to_string(), definition).is_some() {
            info!(name = %name, "Redefined job handler");
        } else {
            info!(name = %name, "Registered job handler");
        }
    }

    pub(crate) async fn get(&self, name: &str) -> Option<Arc<Definition>> {
        self.inner.read().await.get(name).cloned()
    }

    pub(crate) async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.contains_key(name)
    }

    pub(crate) async fn names(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub(crate) async fn reset_counters(&self) {
        for definition in self.inner.read().await.values() {
            definition.running.store(0, Ordering::SeqCst);
            definition.locked.store(0, Ordering::SeqCst);
        }
    }
}
