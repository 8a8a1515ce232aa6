//! Attempt counting and exponential backoff.

use chrono::{DateTime, TimeDelta, Utc};
use flowcore::RetryConfig;
use std::time::Duration;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch once the delay has elapsed.
    RetryAfter(Duration),
    /// Attempts exhausted; the failure is terminal.
    GiveUp,
}

/// Stateless backoff policy. The cap applies when a step does not set its own.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    /// `attempts` is 1-based: the first execution is attempt 1.
    pub fn should_retry(config: &RetryConfig, attempts: u32) -> bool {
        attempts < config.max_attempts
    }

    /// `min(initialDelay * backoffMultiplier^(attempts-1), cap)`
    pub fn next_delay(&self, config: &RetryConfig, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw_ms = config.initial_delay as f64 * config.backoff_multiplier.powi(exponent);
        let cap_ms = config
            .max_delay
            .unwrap_or(self.max_delay.as_millis() as u64) as f64;

        let millis = if raw_ms.is_finite() { raw_ms.min(cap_ms) } else { cap_ms };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    pub fn decide(&self, config: &RetryConfig, attempts: u32) -> RetryDecision {
        if Self::should_retry(config, attempts) {
            RetryDecision::RetryAfter(self.next_delay(config, attempts))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn retry_deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    i64::try_from(delay.as_millis())
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
