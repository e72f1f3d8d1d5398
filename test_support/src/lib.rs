//! ABOUTME: Shared testing utilities: in-memory repository and channel doubles
//! ABOUTME: Common fixtures used by the engine's unit and integration tests

pub mod channel;
pub mod events;
pub mod repository;

pub use channel::MemoryChannel;
pub use events::EventCollector;
pub use repository::MemoryJobRepository;

use ch_sched::SchedulerConfig;

/// Configuration scaled down for fast test runs
pub fn fast_config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        name: name.to_string(),
        process_every_ms: 25,
        default_lock_lifetime_ms: 30_000,
        ..Default::default()
    }
}
