//! # Writer Configuration
//!
//! All tunables are explicit fields on per-instance config structs; nothing is
//! process-wide. Two writers with different policies can run side by side.
//!
//! ## Sources
//!
//! | Source | Entry point |
//! |--------|-------------|
//! | Code | `WriterConfig { max_attempts: 3, ..Default::default() }` |
//! | JSON | [`WriterConfig::from_json`] (missing fields take defaults) |
//! | Environment | [`WriterConfig::from_env`] (`BULKWRITER_*` variables) |
//!
//! Every source goes through [`WriterConfig::validate`] before a writer uses it.
//!
//! ## Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `BULKWRITER_MAX_BATCH_SIZE` | `max_batch_size` |
//! | `BULKWRITER_MAX_ATTEMPTS` | `max_attempts` |
//! | `BULKWRITER_THROTTLING` | `throttle.enabled` (`true`/`false`) |
//! | `BULKWRITER_INITIAL_OPS_PER_SECOND` | `throttle.initial_ops_per_second` |
//! | `BULKWRITER_MAX_OPS_PER_SECOND` | `throttle.max_ops_per_second` |
//! | `BULKWRITER_RETRYABLE_CODES` | `retry.retryable_codes` (comma-separated, e.g. `ABORTED,UNAVAILABLE`) |

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limiter::{
    RateLimiter, DEFAULT_GROWTH_INTERVAL_MS, DEFAULT_GROWTH_MULTIPLIER,
    DEFAULT_INITIAL_OPS_PER_SECOND, UNLIMITED_OPS_PER_SECOND,
};
use crate::retry::RetryPolicy;
use crate::types::StatusCode;

// =============================================================================
// Defaults
// =============================================================================

/// Maximum writes in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;

/// Retries after the first failed attempt before a retryable failure becomes
/// permanent.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Pending deletes at which a recursive delete stops fetching pages.
pub const DEFAULT_MAX_PENDING_OPS: usize = 5000;

/// Pending deletes at which a recursive delete resumes fetching.
pub const DEFAULT_MIN_PENDING_OPS: usize = 1000;

/// Consecutive stream failures a recursive delete tolerates.
pub const DEFAULT_MAX_STREAM_RETRIES: u32 = 10;

const ENV_MAX_BATCH_SIZE: &str = "BULKWRITER_MAX_BATCH_SIZE";
const ENV_MAX_ATTEMPTS: &str = "BULKWRITER_MAX_ATTEMPTS";
const ENV_THROTTLING: &str = "BULKWRITER_THROTTLING";
const ENV_INITIAL_OPS: &str = "BULKWRITER_INITIAL_OPS_PER_SECOND";
const ENV_MAX_OPS: &str = "BULKWRITER_MAX_OPS_PER_SECOND";
const ENV_RETRYABLE_CODES: &str = "BULKWRITER_RETRYABLE_CODES";

// =============================================================================
// Throttling
// =============================================================================

/// Rate limiting options.
///
/// With throttling enabled the writer starts at `initial_ops_per_second`
/// (500 if unset) and grows 1.5x every five minutes, up to
/// `max_ops_per_second` (unbounded if unset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub initial_ops_per_second: Option<u32>,
    pub max_ops_per_second: Option<u32>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_ops_per_second: None,
            max_ops_per_second: None,
        }
    }
}

impl ThrottleConfig {
    /// No rate limit at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            initial_ops_per_second: None,
            max_ops_per_second: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            if self.initial_ops_per_second.is_some() || self.max_ops_per_second.is_some() {
                return Err(Error::InvalidArgument(
                    "cannot set initial_ops_per_second or max_ops_per_second when throttling is disabled"
                        .to_string(),
                ));
            }
            return Ok(());
        }

        if self.initial_ops_per_second == Some(0) {
            return Err(Error::InvalidArgument(
                "initial_ops_per_second must be at least 1".to_string(),
            ));
        }
        if self.max_ops_per_second == Some(0) {
            return Err(Error::InvalidArgument(
                "max_ops_per_second must be at least 1".to_string(),
            ));
        }
        if let (Some(initial), Some(max)) = (self.initial_ops_per_second, self.max_ops_per_second) {
            if max < initial {
                return Err(Error::InvalidArgument(format!(
                    "max_ops_per_second ({}) cannot be less than initial_ops_per_second ({})",
                    max, initial
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Writer Configuration
// =============================================================================

/// Configuration for a [`BulkWriter`](crate::writer::BulkWriter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum writes per batch. Lowered to the starting rate if that is
    /// smaller. Can be changed later with `set_max_batch_size`.
    pub max_batch_size: usize,

    /// How many times a retryable failure is retried. A write is attempted
    /// at most `max_attempts + 1` times.
    pub max_attempts: u32,

    pub retry: RetryPolicy,

    pub throttle: ThrottleConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryPolicy::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size < 1 {
            return Err(Error::InvalidArgument(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        self.throttle.validate()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid writer config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `BULKWRITER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup(ENV_MAX_BATCH_SIZE) {
            config.max_batch_size = parse_var(ENV_MAX_BATCH_SIZE, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_ATTEMPTS) {
            config.max_attempts = parse_var(ENV_MAX_ATTEMPTS, &val)?;
        }
        if let Some(val) = lookup(ENV_THROTTLING) {
            config.throttle.enabled = parse_var(ENV_THROTTLING, &val)?;
        }
        if let Some(val) = lookup(ENV_INITIAL_OPS) {
            config.throttle.initial_ops_per_second = Some(parse_var(ENV_INITIAL_OPS, &val)?);
        }
        if let Some(val) = lookup(ENV_MAX_OPS) {
            config.throttle.max_ops_per_second = Some(parse_var(ENV_MAX_OPS, &val)?);
        }
        if let Some(val) = lookup(ENV_RETRYABLE_CODES) {
            let codes = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_status_code)
                .collect::<Result<Vec<_>>>()?;
            config.retry = RetryPolicy::new(codes);
        }

        config.validate()?;
        Ok(config)
    }

    /// Builds the rate limiter this config describes, starting at `now_ms`,
    /// and returns it with the effective batch size.
    pub(crate) fn build_limiter(&self, now_ms: u64) -> Result<(RateLimiter, usize)> {
        self.validate()?;

        if !self.throttle.enabled {
            return Ok((RateLimiter::unlimited(now_ms), self.max_batch_size));
        }

        let max_rate = self
            .throttle
            .max_ops_per_second
            .map(u64::from)
            .unwrap_or(UNLIMITED_OPS_PER_SECOND);
        let starting_rate = self
            .throttle
            .initial_ops_per_second
            .map(u64::from)
            .unwrap_or(DEFAULT_INITIAL_OPS_PER_SECOND)
            .min(max_rate);

        let limiter = RateLimiter::new(
            starting_rate,
            DEFAULT_GROWTH_MULTIPLIER,
            DEFAULT_GROWTH_INTERVAL_MS,
            max_rate,
            now_ms,
        )?;
        let batch_size = self.max_batch_size.min(starting_rate as usize);
        Ok((limiter, batch_size))
    }
}

fn parse_var<T>(key: &str, val: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{}={:?}: {}", key, val, e)))
}

fn parse_status_code(name: &str) -> Result<StatusCode> {
    serde_json::from_value(serde_json::Value::String(name.to_ascii_uppercase()))
        .map_err(|_| Error::Config(format!("{}: unknown status code {:?}", ENV_RETRYABLE_CODES, name)))
}

// =============================================================================
// Recursive Delete Configuration
// =============================================================================

/// Pacing for [`recursive_delete`](crate::recursive_delete::recursive_delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursiveDeleteConfig {
    /// Most deletes ever pending at once. Also the page size.
    pub max_pending_ops: usize,
    /// A new page is only requested once pending deletes fall to this many.
    pub min_pending_ops: usize,
    /// Consecutive stream failures tolerated before giving up on fetching.
    pub max_stream_retries: u32,
}

impl Default for RecursiveDeleteConfig {
    fn default() -> Self {
        Self {
            max_pending_ops: DEFAULT_MAX_PENDING_OPS,
            min_pending_ops: DEFAULT_MIN_PENDING_OPS,
            max_stream_retries: DEFAULT_MAX_STREAM_RETRIES,
        }
    }
}

impl RecursiveDeleteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_pending_ops < 1 || self.max_pending_ops < 1 {
            return Err(Error::InvalidArgument(
                "pending-op watermarks must be at least 1".to_string(),
            ));
        }
        if self.min_pending_ops > self.max_pending_ops {
            return Err(Error::InvalidArgument(format!(
                "min_pending_ops ({}) cannot exceed max_pending_ops ({})",
                self.min_pending_ops, self.max_pending_ops
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.max_batch_size, 20);
        assert_eq!(config.max_attempts, 10);
        assert!(config.throttle.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_throttle_validation() {
        let bad = [
            ThrottleConfig {
                enabled: false,
                initial_ops_per_second: Some(10),
                max_ops_per_second: None,
            },
            ThrottleConfig {
                enabled: true,
                initial_ops_per_second: Some(0),
                max_ops_per_second: None,
            },
            ThrottleConfig {
                enabled: true,
                initial_ops_per_second: None,
                max_ops_per_second: Some(0),
            },
            ThrottleConfig {
                enabled: true,
                initial_ops_per_second: Some(100),
                max_ops_per_second: Some(50),
            },
        ];
        for throttle in bad {
            assert!(
                matches!(throttle.validate(), Err(Error::InvalidArgument(_))),
                "{:?} should be rejected",
                throttle
            );
        }
        assert!(ThrottleConfig::disabled().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = WriterConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limiter_defaults() {
        let (limiter, batch_size) = WriterConfig::default().build_limiter(0).unwrap();
        assert_eq!(limiter.calculate_capacity(0), 500);
        assert_eq!(limiter.calculate_capacity(300_000), 750);
        assert_eq!(batch_size, 20);
    }

    #[test]
    fn test_starting_rate_lowered_to_max() {
        let config = WriterConfig {
            throttle: ThrottleConfig {
                enabled: true,
                initial_ops_per_second: None,
                max_ops_per_second: Some(5),
            },
            ..Default::default()
        };
        let (limiter, batch_size) = config.build_limiter(0).unwrap();
        assert_eq!(limiter.calculate_capacity(0), 5);
        assert_eq!(limiter.calculate_capacity(10_000_000), 5);
        // The batch size follows the starting rate down.
        assert_eq!(batch_size, 5);
    }

    #[test]
    fn test_disabled_throttle_is_unlimited() {
        let config = WriterConfig {
            throttle: ThrottleConfig::disabled(),
            ..Default::default()
        };
        let (mut limiter, batch_size) = config.build_limiter(0).unwrap();
        assert!(limiter.try_make_request(1_000_000, 0).unwrap());
        assert_eq!(batch_size, 20);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WriterConfig::from_json(
            r#"{"max_attempts": 3, "throttle": {"initial_ops_per_second": 100}}"#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_batch_size, 20);
        assert!(config.throttle.enabled);
        assert_eq!(config.throttle.initial_ops_per_second, Some(100));
        assert!(config.retry.is_retryable(StatusCode::Aborted));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            WriterConfig::from_json("{not json"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            WriterConfig::from_json(r#"{"max_batch_size": 0}"#),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_lookup() {
        let config = WriterConfig::from_lookup(lookup(&[
            (ENV_MAX_BATCH_SIZE, "50"),
            (ENV_MAX_ATTEMPTS, "2"),
            (ENV_MAX_OPS, "1000"),
            (ENV_RETRYABLE_CODES, "unavailable, INTERNAL"),
        ]))
        .unwrap();
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.throttle.max_ops_per_second, Some(1000));
        assert!(config.retry.is_retryable(StatusCode::Internal));
        assert!(config.retry.is_retryable(StatusCode::Unavailable));
        assert!(!config.retry.is_retryable(StatusCode::Aborted));
    }

    #[test]
    fn test_from_lookup_bad_values() {
        assert!(matches!(
            WriterConfig::from_lookup(lookup(&[(ENV_MAX_ATTEMPTS, "lots")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            WriterConfig::from_lookup(lookup(&[(ENV_RETRYABLE_CODES, "SOMETIMES")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            WriterConfig::from_lookup(lookup(&[
                (ENV_THROTTLING, "false"),
                (ENV_INITIAL_OPS, "10")
            ])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_recursive_delete_config() {
        assert!(RecursiveDeleteConfig::default().validate().is_ok());
        let bad = RecursiveDeleteConfig {
            max_pending_ops: 10,
            min_pending_ops: 20,
            max_stream_retries: 1,
        };
        assert!(bad.validate().is_err());
    }
}
