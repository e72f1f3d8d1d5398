//! ABOUTME: Scheduler configuration with validation and environment loading
//! ABOUTME: Defaults match the engine's documented polling and lease settings

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use validator::Validate;

use ch_core::{Error, Result};

use crate::fork::ForkHelper;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker identity recorded as `last_modified_by` on saves
    #[validate(length(min = 1))]
    pub name: String,
    /// Poll period of the processor scan in milliseconds
    #[validate(range(min = 1))]
    pub process_every_ms: u64,
    /// Per-name concurrency when a definition does not set its own
    #[validate(range(min = 1, max = 1000))]
    pub default_concurrency: usize,
    /// Hard cap on simultaneously running jobs in this process
    #[validate(range(min = 1, max = 10000))]
    pub max_concurrency: usize,
    /// Per-name lock cap when a definition does not set its own; 0 = unbounded
    pub default_lock_limit: usize,
    /// Global lock cap across all names; 0 = unbounded
    pub lock_limit: usize,
    /// Lease duration when a definition does not set its own
    #[validate(range(min = 1))]
    pub default_lock_lifetime_ms: u64,
    /// Child worker used for fork-mode execution
    pub fork_helper: Option<ForkHelper>,
    /// Set when this process is itself a forked child
    pub forked_worker: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: instance_name(),
            process_every_ms: 5000,
            default_concurrency: 5,
            max_concurrency: 20,
            default_lock_limit: 0,
            lock_limit: 0,
            default_lock_lifetime_ms: 600_000, // 10 minutes
            fork_helper: None,
            forked_worker: false,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from an optional `chime` file plus `CHIME_`
    /// environment overrides
    pub fn load() -> Result<Self> {
        let settings = ConfigBuilder::builder()
            .add_source(File::with_name("chime").required(false))
            .add_source(Environment::with_prefix("CHIME").separator("__"))
            .build()?;
        let config: SchedulerConfig = settings.try_deserialize().map_err(Error::from)?;
        config.validated()
    }

    /// Validate field ranges, failing fast on misconfiguration
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| Error::Config(format!("Invalid scheduler configuration: {}", e)))?;
        Ok(self)
    }

    pub fn process_every(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.process_every_ms)
    }

    pub fn default_lock_lifetime(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.default_lock_lifetime_ms as i64)
    }
}

/// Default worker identity: `hostname:pid`
pub fn instance_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}
