//! ABOUTME: The chime scheduling engine: persistent jobs claimed under
//! ABOUTME: lease-based locks, with retries, recurrence, and notifications

pub mod channel;
pub mod config;
pub mod definition;
pub mod events;
pub mod fork;
pub mod job;
mod processor;
pub mod repository;
pub mod scheduler;

pub use channel::{
    ChannelState, JobNotification, JobStateNotification, NotificationChannel, ReconnectPolicy,
    ReconnectingChannel,
};
pub use config::SchedulerConfig;
pub use definition::{DefineOptions, Definition};
pub use events::{EventBus, JobEvents, SchedulerEvent};
pub use fork::ForkHelper;
pub use job::{
    DebounceOptions, DebounceStrategy, Job, JobAttrs, JobState, JobType, JobWithState,
    RepeatOptions, UniqueOptions, When,
};
pub use repository::{
    JobOverview, JobPage, JobRepository, JobSelector, QueryOptions, SaveOptions,
};
pub use scheduler::{DrainOptions, DrainOutcome, EveryOptions, Scheduler};
