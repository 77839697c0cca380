//! Runtime configuration for the upload queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RetryConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}={value}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Configuration for the worker loop and job defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of concurrent worker loops.
    pub workers: u32,
    /// Delay between polls when no wake signal arrives (milliseconds).
    pub poll_interval_ms: u64,
    /// How long a job may stay `processing` before it is reclaimed (milliseconds).
    pub liveness_timeout_ms: u64,
    /// Per-attempt upload timeout (milliseconds). Must stay below the
    /// liveness timeout so a live worker never outlasts its claim.
    pub upload_timeout_ms: u64,
    /// Default max attempts for newly enqueued jobs.
    pub default_max_attempts: u32,
    /// Cap on the worker backoff while the job store is unreachable (milliseconds).
    pub max_storage_backoff_ms: u64,
    /// Retry policy settings.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval_ms: 1_000,
            liveness_timeout_ms: 600_000,
            upload_timeout_ms: 300_000,
            default_max_attempts: 5,
            max_storage_backoff_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Build a config from `RECSYNC_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// - `RECSYNC_WORKERS`
    /// - `RECSYNC_POLL_INTERVAL_MS`
    /// - `RECSYNC_LIVENESS_TIMEOUT_SECS`
    /// - `RECSYNC_UPLOAD_TIMEOUT_SECS`
    /// - `RECSYNC_MAX_ATTEMPTS`
    /// - `RECSYNC_MAX_STORAGE_BACKOFF_MS`
    /// - `RECSYNC_RETRY_BASE_MS`, `RECSYNC_RETRY_FACTOR`,
    ///   `RECSYNC_RETRY_MAX_MS`, `RECSYNC_RETRY_JITTER`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "RECSYNC_WORKERS")? {
            cfg.workers = v;
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_POLL_INTERVAL_MS")? {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "RECSYNC_LIVENESS_TIMEOUT_SECS")? {
            cfg.liveness_timeout_ms = v.saturating_mul(1_000);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "RECSYNC_UPLOAD_TIMEOUT_SECS")? {
            cfg.upload_timeout_ms = v.saturating_mul(1_000);
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_MAX_ATTEMPTS")? {
            cfg.default_max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_MAX_STORAGE_BACKOFF_MS")? {
            cfg.max_storage_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_RETRY_BASE_MS")? {
            cfg.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_RETRY_FACTOR")? {
            cfg.retry.backoff_factor = v;
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_RETRY_MAX_MS")? {
            cfg.retry.max_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RECSYNC_RETRY_JITTER")? {
            cfg.retry.jitter = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the settings against each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_timeout_ms == 0 {
            return Err(ConfigError::Inconsistent("upload timeout must be positive".into()));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Inconsistent("max attempts must be at least 1".into()));
        }
        Self::check_timeouts(self.upload_timeout(), self.liveness_timeout())
    }

    /// An upload must time out before its claim can go stale, or a
    /// reclaim could start a second upload of the same job.
    pub fn check_timeouts(upload: Duration, liveness: Duration) -> Result<(), ConfigError> {
        if upload >= liveness {
            return Err(ConfigError::Inconsistent(format!(
                "upload timeout {upload:?} must be shorter than liveness timeout {liveness:?}"
            )));
        }
        Ok(())
    }

    /// Set the number of workers.
    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// Set the liveness timeout.
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the per-attempt upload timeout.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout_ms = duration_ms(timeout);
        self
    }

    /// Cap the backoff applied while the job store is unreachable.
    pub fn with_max_storage_backoff(mut self, max: Duration) -> Self {
        self.max_storage_backoff_ms = duration_ms(max);
        self
    }

    /// Set the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn max_storage_backoff(&self) -> Duration {
        Duration::from_millis(self.max_storage_backoff_ms)
    }
}

/// Whole milliseconds, rounding a non-zero sub-millisecond value up to 1.
fn duration_ms(d: Duration) -> u64 {
    let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 && !d.is_zero() { 1 } else { ms }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        })
}
