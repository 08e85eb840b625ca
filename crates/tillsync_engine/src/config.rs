//! Configuration for the sync core.

use std::time::Duration;
use tillsync_protocol::Origin;

/// Configuration for stores, reconcilers, and safe operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this client context.
    pub origin: Origin,
    /// Interval between authoritative backend polls.
    pub poll_interval: Duration,
    /// Lock TTL for point adjustments (single remote call).
    pub adjust_ttl: Duration,
    /// Lock TTL for the multi-step session close flow.
    pub close_ttl: Duration,
    /// Lock TTL for the multi-step reward redemption flow.
    pub redeem_ttl: Duration,
    /// Timeout on a single gateway call; expiry becomes
    /// `RemoteUnavailable`.
    pub gateway_timeout: Duration,
    /// Retry policy for transient gateway failures. Defaults to no
    /// retries so a held lock is never stretched by silent retries.
    pub gateway_retry: RetryConfig,
    /// Retry policy for `ResourceBusy` in safe operations. Defaults to
    /// no retries; callers opt in.
    pub busy_retry: RetryConfig,
    /// Interval for the lock manager's expiry sweep.
    pub sweep_interval: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given client origin.
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            poll_interval: Duration::from_secs(10),
            adjust_ttl: Duration::from_secs(5),
            close_ttl: Duration::from_secs(30),
            redeem_ttl: Duration::from_secs(15),
            gateway_timeout: Duration::from_secs(10),
            gateway_retry: RetryConfig::no_retry(),
            busy_retry: RetryConfig::no_retry(),
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the gateway timeout.
    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    /// Sets the transient-failure retry policy for the gateway.
    pub fn with_gateway_retry(mut self, retry: RetryConfig) -> Self {
        self.gateway_retry = retry;
        self
    }

    /// Sets the lock-contention retry policy for safe operations.
    pub fn with_busy_retry(mut self, retry: RetryConfig) -> Self {
        self.busy_retry = retry;
        self
    }

    /// Sets the lock table's expiry sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets all three lock TTLs at once.
    pub fn with_lock_ttls(mut self, adjust: Duration, close: Duration, redeem: Duration) -> Self {
        self.adjust_ttl = adjust;
        self.close_ttl = close;
        self.redeem_ttl = redeem;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
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

    /// Disables jitter, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter: f64 = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::no_retry()
    }
}
