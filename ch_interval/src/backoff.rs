//! ABOUTME: Retry backoff strategies evaluated between failed job attempts
//! ABOUTME: Pure functions from attempt context to the next delay, or stop

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Context handed to a backoff strategy after a failed attempt
#[derive(Debug, Clone, Default)]
pub struct BackoffContext {
    /// 1-based attempt number (equals the job's fail count)
    pub attempt: u32,
    /// Message of the error that caused this attempt to fail
    pub error: Option<String>,
    /// Delay applied before this attempt, when known
    pub last_delay: Option<Duration>,
}

/// A retry policy: returns the delay before the next attempt, or `None` to
/// stop retrying
pub trait BackoffStrategy: Send + Sync {
    fn next_delay(&self, ctx: &BackoffContext) -> Option<Duration>;
}

/// Shared handle to a backoff strategy
pub type Backoff = Arc<dyn BackoffStrategy>;

struct Constant {
    delay: Duration,
    max_retries: u32,
}

impl BackoffStrategy for Constant {
    fn next_delay(&self, ctx: &BackoffContext) -> Option<Duration> {
        if ctx.attempt > self.max_retries {
            None
        } else {
            Some(self.delay)
        }
    }
}

struct Linear {
    delay: Duration,
    increment: Duration,
    max_retries: u32,
}

impl BackoffStrategy for Linear {
    fn next_delay(&self, ctx: &BackoffContext) -> Option<Duration> {
        if ctx.attempt > self.max_retries {
            return None;
        }
        Some(self.delay + self.increment * ctx.attempt.saturating_sub(1))
    }
}

struct Exponential {
    delay: Duration,
    factor: f64,
    max_retries: u32,
    jitter: f64,
}

impl BackoffStrategy for Exponential {
    fn next_delay(&self, ctx: &BackoffContext) -> Option<Duration> {
        if ctx.attempt > self.max_retries {
            return None;
        }
        let base =
            self.delay.as_millis() as f64 * self.factor.powi(ctx.attempt.saturating_sub(1) as i32);
        let multiplier = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Some(Duration::from_millis((base * multiplier).max(0.0) as u64))
    }
}

struct Combine {
    strategies: Vec<Backoff>,
}

impl BackoffStrategy for Combine {
    fn next_delay(&self, ctx: &BackoffContext) -> Option<Duration> {
        self.strategies.iter().find_map(|s| s.next_delay(ctx))
    }
}

struct When<P> {
    predicate: P,
    inner: Backoff,
}

impl<P> BackoffStrategy for When<P>
where
    P: Fn(&BackoffContext) -> bool + Send + Sync,
{
    fn next_delay(&self, ctx: &BackoffContext) -> Option<Duration> {
        if (self.predicate)(ctx) {
            self.inner.next_delay(ctx)
        } else {
            None
        }
    }
}

/// Fixed delay for up to `max_retries` attempts
pub fn constant(delay: Duration, max_retries: u32) -> Backoff {
    Arc::new(Constant { delay, max_retries })
}

/// Delay growing by `increment` per attempt
pub fn linear(delay: Duration, increment: Duration, max_retries: u32) -> Backoff {
    Arc::new(Linear {
        delay,
        increment,
        max_retries,
    })
}

/// Delay multiplied by `factor` per attempt, with optional jitter.
///
/// `jitter` in `[0, 1]` scales the computed delay by `1 ± U(0, jitter)`.
pub fn exponential(delay: Duration, factor: f64, max_retries: u32, jitter: f64) -> Backoff {
    Arc::new(Exponential {
        delay,
        factor,
        max_retries,
        jitter: jitter.clamp(0.0, 1.0),
    })
}

/// 100ms doubling, 3 retries
pub fn aggressive() -> Backoff {
    exponential(Duration::from_millis(100), 2.0, 3, 0.0)
}

/// 500ms doubling, 5 retries
pub fn standard() -> Backoff {
    exponential(Duration::from_millis(500), 2.0, 5, 0.0)
}

/// 1000ms doubling, 8 retries
pub fn relaxed() -> Backoff {
    exponential(Duration::from_millis(1000), 2.0, 8, 0.0)
}

/// First strategy returning a delay wins; all `None` stops retrying
pub fn combine(strategies: Vec<Backoff>) -> Backoff {
    Arc::new(Combine { strategies })
}

/// Gate a strategy behind a predicate on the attempt context
pub fn when<P>(predicate: P, strategy: Backoff) -> Backoff
where
    P: Fn(&BackoffContext) -> bool + Send + Sync + 'static,
{
    Arc::new(When {
        predicate,
        inner: strategy,
    })
}
