//! Retry configuration and the backoff policy.

use std::error::Error;
use std::time::Duration;

use crate::error::Phase;

/// How a transaction should be retried.
///
/// Configs are pure data. [`execute`](crate::execute) takes one by reference
/// and copies it for the duration of the call, so a config can be shared
/// freely between callers.
///
/// # Bounds Behavior
///
/// - `max_retries` counts retries, not attempts: `3` means up to 4 attempts.
/// - Every computed delay is capped at `max_backoff`. If `initial_backoff`
///   exceeds `max_backoff` the range is not rejected; each delay is simply
///   clamped to `max_backoff`.
/// - A `backoff_factor` below `1.0` is treated as `1.0`.
///
/// # Examples
///
/// ```rust
/// use txretry::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default()
///     .with_max_retries(5)
///     .with_max_backoff(Duration::from_secs(1));
///
/// assert_eq!(config.next_delay(0), Duration::ZERO);
/// assert_eq!(config.next_delay(1), Duration::from_millis(100));
/// assert_eq!(config.next_delay(2), Duration::from_millis(200));
/// assert_eq!(config.next_delay(5), Duration::from_secs(1)); // capped
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_factor: f64,
    attempt_timeout: Option<Duration>,
    #[cfg_attr(feature = "serde", serde(default))]
    jitter: JitterStrategy,
}

/// Strategy for adding randomness to delays.
///
/// Only applied when the `jitter` feature is enabled. Jitter makes delays
/// nondeterministic, so tests that assert on exact timings should keep the
/// default [`JitterStrategy::None`].
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum JitterStrategy {
    /// No jitter applied.
    #[default]
    None,
    /// Add ±percentage randomness to delay.
    Proportional(f64),
    /// Random delay between 0 and calculated delay (AWS recommended).
    Full,
}

/// Information about a failed attempt that is about to be retried.
///
/// Passed to hooks registered with [`Executor::on_retry`](crate::Executor::on_retry).
#[derive(Debug, Clone)]
pub struct RetryEvent<'a> {
    /// Which attempt just failed (1-indexed).
    pub attempt: u32,
    /// The phase that failed.
    pub phase: Phase,
    /// The error from the failed attempt.
    pub error: &'a (dyn Error + Send + Sync + 'static),
    /// Delay before the next attempt.
    pub next_delay: Duration,
    /// Total elapsed time since the first attempt started.
    pub elapsed: Duration,
}

/// Default used for [`RetryConfig::attempt_timeout`].
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for RetryConfig {
    /// `max_retries = 3`, `initial_backoff = 100ms`, `max_backoff = 2s`,
    /// `backoff_factor = 2.0`, 30s per attempt, no jitter.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_factor: 2.0,
            attempt_timeout: Some(DEFAULT_ATTEMPT_TIMEOUT),
            jitter: JitterStrategy::None,
        }
    }
}

/// Fresh default config. Same as [`RetryConfig::default`].
pub fn default_retry_config() -> RetryConfig {
    RetryConfig::default()
}

impl RetryConfig {
    /// Build a config from the four backoff parameters.
    ///
    /// The attempt timeout and jitter take their defaults.
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_factor,
            ..Self::default()
        }
    }

    /// A config that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::default().with_max_retries(0)
    }

    /// Set the maximum number of retries (not counting the first attempt).
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    /// Set the delay ceiling.
    pub fn with_max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    /// Set the growth factor between consecutive delays.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Bound each attempt (begin, work and commit together) by `timeout`.
    ///
    /// `None` leaves attempts bounded only by the caller's context.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Add proportional jitter to delays.
    ///
    /// `0.25` means the actual delay lands within ±25% of the computed one.
    /// Requires the `jitter` feature; without it this has no effect.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = JitterStrategy::Proportional(factor.clamp(0.0, 1.0));
        self
    }

    /// Use full jitter: each delay is uniform in `[0, computed]`.
    ///
    /// Requires the `jitter` feature; without it this has no effect.
    pub fn with_full_jitter(mut self) -> Self {
        self.jitter = JitterStrategy::Full;
        self
    }

    /// Maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the first retry.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Delay ceiling.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Growth factor.
    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    /// Per-attempt timeout.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Jitter strategy.
    pub fn jitter(&self) -> &JitterStrategy {
        &self.jitter
    }

    /// Delay before retry `n`.
    ///
    /// `n = 0` is the first attempt and never waits. For `n >= 1` the delay is
    /// `min(initial_backoff * factor^(n-1), max_backoff)`. Deterministic; jitter
    /// is applied separately by [`RetryConfig::jittered_delay`].
    ///
    /// ```rust
    /// use txretry::RetryConfig;
    /// use std::time::Duration;
    ///
    /// let config = RetryConfig::default();
    /// assert_eq!(config.next_delay(1), Duration::from_millis(100));
    /// assert_eq!(config.next_delay(3), Duration::from_millis(400));
    /// assert_eq!(config.next_delay(10), Duration::from_secs(2));
    /// ```
    pub fn next_delay(&self, n: u32) -> Duration {
        if n == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(n - 1).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * factor.powi(exponent);
        let ceiling = self.max_backoff.as_secs_f64();

        // powi overflows to infinity long before u64 seconds would; clamp first
        if !scaled.is_finite() || scaled >= ceiling {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Delay before retry `n` with the configured jitter applied.
    ///
    /// The result never exceeds `max_backoff`.
    pub fn jittered_delay(&self, n: u32) -> Duration {
        self.jitter.apply(self.next_delay(n), self.max_backoff)
    }

    /// Report configuration mistakes.
    ///
    /// An inverted backoff range is reported here but still accepted by
    /// [`execute`](crate::execute), which clamps every delay to `max_backoff`.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            Err("backoff_factor must be a finite value >= 1.0")
        } else if self.initial_backoff > self.max_backoff {
            Err("initial_backoff must not exceed max_backoff")
        } else {
            Ok(())
        }
    }
}

impl JitterStrategy {
    /// Apply jitter to a base delay, capped at `max_delay`.
    pub fn apply(&self, base_delay: Duration, max_delay: Duration) -> Duration {
        let jittered = match self {
            JitterStrategy::None => base_delay,
            #[cfg(feature = "jitter")]
            JitterStrategy::Proportional(factor) => {
                use rand::Rng;
                let base_millis = base_delay.as_millis() as f64;
                let jitter_range = base_millis * factor;
                let min = (base_millis - jitter_range).max(0.0);
                let max = base_millis + jitter_range;
                if max <= min {
                    base_delay
                } else {
                    let jittered_millis = rand::rng().random_range(min..=max);
                    Duration::from_millis(jittered_millis as u64)
                }
            }
            #[cfg(not(feature = "jitter"))]
            JitterStrategy::Proportional(_) => base_delay,
            #[cfg(feature = "jitter")]
            JitterStrategy::Full => {
                use rand::Rng;
                let max_millis = base_delay.as_millis() as u64;
                if max_millis == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::rng().random_range(0..=max_millis))
                }
            }
            #[cfg(not(feature = "jitter"))]
            JitterStrategy::Full => base_delay,
        };

        jittered.min(max_delay)
    }
}
