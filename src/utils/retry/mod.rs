//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! Used by the bridge's error policy to space out immediate retries of a
//! message whose dispatch failed.

use std::time::Duration;

use rand::Rng;

use crate::config::BridgeConfig;

/// Upper bound of the jitter added on top of the capped delay.
pub const MAX_JITTER: f64 = 0.2;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Retries allowed before the message is given up on.
    pub max_retries: u32,
    /// Jitter factor: a random extra of up to `jitter * delay` is added.
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 15,
            jitter: MAX_JITTER,
        }
    }
}

impl RetryConfig {
    /// Retry settings from the bridge configuration.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_retries: config.max_retries,
            jitter: MAX_JITTER,
        }
    }

    /// Delay before jitter for the given failure count (1-indexed).
    ///
    /// `base * 2^(failures - 1)`, capped at `max_delay`.
    pub fn base_delay_for_failure(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(exponential_ms.min(self.max_delay.as_millis() as u64))
    }

    /// Delay with jitter for the given failure count (1-indexed).
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        let capped = self.base_delay_for_failure(failures);
        let jitter = self.jitter.clamp(0.0, MAX_JITTER);
        if jitter <= 0.0 {
            return capped;
        }
        let extra = rand::rng().random_range(0.0..=jitter);
        capped + capped.mul_f64(extra)
    }

    /// Whether a message that has failed `failures` times may be retried.
    ///
    /// A message is retried up to and including its `max_retries`-th
    /// failure and given up on at the next one.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}
