//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use edgesync_protocol::{ConflictPolicy, EntityType};
use std::time::Duration;

/// Shortest auto-sync interval accepted by default.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Longest auto-sync interval accepted by default.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for sync runs and the scheduler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Entity types in processing order.
    pub entity_types: Vec<EntityType>,
    /// Retry behavior for connector calls.
    pub retry: RetryConfig,
    /// Timeout applied to each connector call.
    pub call_timeout: Duration,
    /// Policy for divergent entities.
    pub conflict_policy: ConflictPolicy,
    /// Smallest allowed auto-sync interval.
    pub min_interval: Duration,
    /// Largest allowed auto-sync interval.
    pub max_interval: Duration,
    /// Number of runs returned by status queries.
    pub recent_runs_limit: usize,
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            entity_types: EntityType::ALL.to_vec(),
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(30),
            conflict_policy: ConflictPolicy::LastWriteWins,
            min_interval: MIN_INTERVAL,
            max_interval: MAX_INTERVAL,
            recent_runs_limit: 10,
        }
    }

    /// Sets the entity types and their processing order.
    pub fn with_entity_types(mut self, entity_types: Vec<EntityType>) -> Self {
        self.entity_types = entity_types;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the accepted auto-sync interval range.
    pub fn with_interval_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_interval = min;
        self.max_interval = max;
        self
    }

    /// Sets how many runs status queries return.
    pub fn with_recent_runs_limit(mut self, limit: usize) -> Self {
        self.recent_runs_limit = limit;
        self
    }

    /// Checks an auto-sync interval against the configured bounds.
    pub fn validate_interval(&self, interval_ms: u64) -> SyncResult<Duration> {
        let interval = Duration::from_millis(interval_ms);
        if interval < self.min_interval || interval > self.max_interval {
            return Err(SyncError::Validation(format!(
                "intervalMs must be between {} and {}, got {interval_ms}",
                self.min_interval.as_millis(),
                self.max_interval.as_millis()
            )));
        }
        Ok(interval)
    }

    /// Pulls an interval into the configured bounds.
    pub fn clamp_interval(&self, interval_ms: u64) -> u64 {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        interval_ms.clamp(millis(self.min_interval), millis(self.max_interval))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter.
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Cheap jitter source without an RNG dependency.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
