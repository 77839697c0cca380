//! Retry decisions with capped exponential backoff and bounded jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How an upload failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeouts, rate limits: worth another attempt.
    Transient,
    /// Authentication or validation failures: retrying cannot help.
    Permanent,
}

/// Serializable retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt. Values below 1.0 are treated as 1.0.
    pub backoff_factor: f64,
    /// Upper bound for any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Fraction of the delay added as uniform random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 5 * 60 * 1_000,
            jitter: 0.2,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Pure retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.backoff_factor,
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        let backoff_factor = if backoff_factor.is_finite() {
            backoff_factor.max(1.0)
        } else {
            1.0
        };
        Self {
            base_delay: base_delay.min(max_delay),
            backoff_factor,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Deterministic delay: `base_delay * backoff_factor^attempts`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.backoff_factor.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Backoff plus uniform jitter in `[0, jitter * backoff]`, still capped.
    pub fn jittered<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempts);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let extra = Duration::from_secs_f64(rng.random_range(0.0..=spread));
        (delay + extra).min(self.max_delay)
    }

    /// Decide whether a job that has started `attempts` of `max_attempts`
    /// attempts should be retried after an error of `class`.
    pub fn decide(&self, attempts: u32, max_attempts: u32, class: ErrorClass) -> RetryDecision {
        self.decide_with(attempts, max_attempts, class, &mut rand::rng())
    }

    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        attempts: u32,
        max_attempts: u32,
        class: ErrorClass,
        rng: &mut R,
    ) -> RetryDecision {
        match class {
            ErrorClass::Permanent => RetryDecision::give_up(),
            ErrorClass::Transient if attempts >= max_attempts => RetryDecision::give_up(),
            ErrorClass::Transient => RetryDecision {
                retry: true,
                delay: self.jittered(attempts, rng),
            },
        }
    }
}
