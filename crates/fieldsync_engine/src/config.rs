//! Configuration for the sync engine.

use fieldsync_protocol::DeviceId;
use std::time::Duration;

/// Configuration for sync sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device ID (one local store per device).
    pub device_id: DeviceId,
    /// Maximum entries per push request.
    pub push_batch_size: usize,
    /// Timeout applied to each network call.
    pub request_timeout: Duration,
    /// Retry configuration for network calls.
    pub retry: RetryConfig,
    /// How long archived conflicts are kept.
    pub conflict_retention: Duration,
    /// Number of session summaries kept in the audit history.
    pub session_history: usize,
    /// Interval for periodic sync.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            push_batch_size: 50,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            conflict_retention: Duration::from_secs(30 * 24 * 60 * 60),
            session_history: 50,
            sync_interval: None,
        }
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the conflict retention window.
    pub fn with_conflict_retention(mut self, retention: Duration) -> Self {
        self.conflict_retention = retention;
        self
    }

    /// Sets the interval for periodic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets how many session summaries are kept.
    pub fn with_session_history(mut self, count: usize) -> Self {
        self.session_history = count;
        self
    }

    /// Returns the conflict retention as a chrono duration.
    pub(crate) fn conflict_retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.conflict_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DeviceId::from_u128(0))
    }
}

/// Configuration for retry behavior.
///
/// Attempt 0 runs immediately; attempt `n` waits
/// `min(initial_delay * multiplier^(n-1), max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    ///
    /// Jitter adds up to 25% but never pushes the delay past `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let mut delay_secs = base_delay.min(max_secs);

        if self.add_jitter {
            delay_secs += delay_secs * 0.25 * rand::random::<f64>();
        }
        Duration::from_secs_f64(delay_secs.min(max_secs))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// How a record's storage footprint is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Footprint {
    /// Every record occupies one slot.
    Slots,
    /// Records occupy their payload size in bytes.
    PayloadBytes,
}

/// Configuration for the eviction manager.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Total local capacity, in `footprint` units.
    pub capacity: usize,
    /// Footprint measure.
    pub footprint: Footprint,
    /// Synced records touched more recently than this are never evicted.
    pub min_idle: Duration,
}

impl EvictionConfig {
    /// Creates a slot-based configuration.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            footprint: Footprint::Slots,
            min_idle: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the footprint measure.
    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = footprint;
        self
    }

    /// Sets the retention window.
    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new(DeviceId::from_u128(2))
            .with_push_batch_size(25)
            .with_request_timeout(Duration::from_secs(60));

        assert_eq!(config.device_id, DeviceId::from_u128(2));
        assert_eq!(config.push_batch_size, 25);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.conflict_retention, Duration::from_secs(2_592_000));
    }

    #[test]
    fn push_batch_size_never_zero() {
        assert_eq!(SyncConfig::default().with_push_batch_size(0).push_batch_size, 1);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn default_backoff_schedule() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (0..8)
            .map(|a| config.delay_for_attempt(a).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::new(5).with_jitter(true);
        let delay = config.delay_for_attempt(2);
        assert!(delay >= Duration::from_secs(2));
        assert!(delay <= Duration::from_millis(2500));
    }

    #[test]
    fn jitter_never_exceeds_max_delay() {
        let config = RetryConfig::new(10).with_jitter(true);
        for attempt in 6..10 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay <= config.max_delay, "attempt {attempt} waited {delay:?}");
            assert!(delay >= Duration::from_secs(30));
        }
    }
}
