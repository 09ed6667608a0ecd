//! Scheduler configuration.

use std::time::Duration;

use crate::RetryPolicy;

/// Default minimum sleep between driver iterations.
const DEFAULT_MIN_SLEEP: Duration = Duration::from_millis(100);

/// Default maximum sleep between driver iterations.
const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(60);

/// Default interval between retention sweeps.
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Default capacity of the event channel.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tunables for a [`crate::Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Retry policy for tasks registered without one.
    pub default_retry_policy: RetryPolicy,
    /// Budget for a single delivery. Exceeding it counts as a failure.
    pub delivery_timeout: Option<Duration>,
    /// How long cancelled/exhausted records are kept. `None` keeps them
    /// until purged.
    pub retention: Option<Duration>,
    /// Lower bound on driver sleeps.
    pub min_sleep: Duration,
    /// Upper bound on driver sleeps.
    pub max_sleep: Duration,
    /// How often the driver runs retention sweeps.
    pub gc_interval: Duration,
    /// Buffered events per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_retry_policy: RetryPolicy::default(),
            delivery_timeout: None,
            retention: None,
            min_sleep: DEFAULT_MIN_SLEEP,
            max_sleep: DEFAULT_MAX_SLEEP,
            gc_interval: DEFAULT_GC_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = Some(timeout);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_sleep_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_sleep = min;
        self.max_sleep = max.max(min);
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_bounds() {
        let config = SchedulerConfig::default();
        assert!(config.min_sleep < config.max_sleep);

        let config = config.with_sleep_bounds(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(config.max_sleep, Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_keep_records() {
        let config = SchedulerConfig::default();
        assert!(config.retention.is_none());
        assert!(config.delivery_timeout.is_none());
        assert_eq!(config.default_retry_policy, RetryPolicy::default());
    }
}
