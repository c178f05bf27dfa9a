//! Retry configuration and backoff.
//!
//! [`RetryConfig`] is pure data: it describes how many times to retry and how
//! long to wait in between, and [`RetryConfig::next_delay`] turns an attempt
//! number into a delay without side effects.
//!
//! # Quick Start
//!
//! ```rust
//! use txretry::RetryConfig;
//! use std::time::Duration;
//!
//! // 3 retries, 100ms, 200ms, 400ms, capped at 2s
//! let config = RetryConfig::default();
//!
//! // tighter settings for an interactive request
//! let config = RetryConfig::new(
//!     5,
//!     Duration::from_millis(20),
//!     Duration::from_millis(500),
//!     1.5,
//! )
//! .with_attempt_timeout(Some(Duration::from_secs(2)));
//!
//! assert_eq!(config.next_delay(1), Duration::from_millis(20));
//! assert_eq!(config.next_delay(2), Duration::from_millis(30));
//! ```
//!
//! # Jitter Support
//!
//! Jitter adds randomness to delays to keep many clients from retrying in
//! lockstep. Enable the `jitter` feature to use it:
//!
//! ```toml
//! txretry = { version = "...", features = ["jitter"] }
//! ```
//!
//! Without the feature, jitter settings are accepted and ignored, which keeps
//! delays deterministic.

mod policy;

pub use policy::{
    default_retry_config, JitterStrategy, RetryConfig, RetryEvent, DEFAULT_ATTEMPT_TIMEOUT,
};
