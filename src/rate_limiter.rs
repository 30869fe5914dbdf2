//! # Ramping Token Bucket
//!
//! A continuous-refill token bucket whose refill rate itself grows in discrete
//! steps. Capacity is measured in operations per second:
//!
//! ```text
//! capacity(t) = min(max, floor(initial * multiplier ^ floor((t - start) / interval)))
//!
//!  ops/s
//!   1687 ┤                              ┌──────
//!   1125 ┤                    ┌─────────┘
//!    750 ┤          ┌─────────┘
//!    500 ┼──────────┘
//!        └──────────┬─────────┬─────────┬────── t
//!                  5m        10m       15m
//! ```
//!
//! Tokens refill at `capacity(t)` per second and never exceed `capacity(t)`.
//! A batch of `n` operations costs `n` tokens.
//!
//! ## Determinism
//!
//! Every method takes the current time as an argument. The limiter never reads
//! a clock itself, so the same sequence of calls always produces the same
//! answers. The dispatch actor is its only caller, so it needs no locking.
//!
//! ## Allow/Delay Duality
//!
//! For any `n` and `t`, [`RateLimiter::next_request_delay_ms`] returns
//! `Some(0)` exactly when [`RateLimiter::try_make_request`] would allow the
//! request, and `None` exactly when `n` exceeds the capacity at `t`.

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Starting operations per second (the "500" of the 500/50/5 ramp-up rule).
pub const DEFAULT_INITIAL_OPS_PER_SECOND: u64 = 500;

/// Capacity multiplier applied at every growth step.
pub const DEFAULT_GROWTH_MULTIPLIER: f64 = 1.5;

/// Time between growth steps: five minutes.
pub const DEFAULT_GROWTH_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// Capacity used when throttling is disabled.
pub const UNLIMITED_OPS_PER_SECOND: u64 = u32::MAX as u64;

// =============================================================================
// Rate Limiter
// =============================================================================

/// Token bucket with stepped capacity growth.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    initial_capacity: u64,
    multiplier: f64,
    multiplier_interval_ms: u64,
    max_capacity: u64,

    available_tokens: f64,
    last_refill_ms: u64,
    start_ms: u64,
}

impl RateLimiter {
    /// Creates a limiter that starts full at `start_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a capacity is zero, `max_capacity`
    /// is below `initial_capacity`, the multiplier is below 1, or the growth
    /// interval is zero.
    pub fn new(
        initial_capacity: u64,
        multiplier: f64,
        multiplier_interval_ms: u64,
        max_capacity: u64,
        start_ms: u64,
    ) -> Result<Self> {
        if initial_capacity == 0 {
            return Err(Error::InvalidArgument(
                "initial capacity must be at least 1".to_string(),
            ));
        }
        if max_capacity < initial_capacity {
            return Err(Error::InvalidArgument(format!(
                "max capacity {} is below initial capacity {}",
                max_capacity, initial_capacity
            )));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::InvalidArgument(format!(
                "growth multiplier must be >= 1, got {}",
                multiplier
            )));
        }
        if multiplier_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "growth interval must be positive".to_string(),
            ));
        }

        Ok(Self {
            initial_capacity,
            multiplier,
            multiplier_interval_ms,
            max_capacity,
            available_tokens: initial_capacity as f64,
            last_refill_ms: start_ms,
            start_ms,
        })
    }

    /// A limiter that never denies a realistic request.
    pub fn unlimited(start_ms: u64) -> Self {
        Self {
            initial_capacity: UNLIMITED_OPS_PER_SECOND,
            multiplier: 1.0,
            multiplier_interval_ms: u64::MAX,
            max_capacity: UNLIMITED_OPS_PER_SECOND,
            available_tokens: UNLIMITED_OPS_PER_SECOND as f64,
            last_refill_ms: start_ms,
            start_ms,
        }
    }

    /// Operations per second allowed at `now_ms`.
    pub fn calculate_capacity(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.start_ms);
        let steps = elapsed / self.multiplier_interval_ms;
        let steps = i32::try_from(steps).unwrap_or(i32::MAX);
        let grown = (self.initial_capacity as f64 * self.multiplier.powi(steps)).floor();
        // `as` saturates, so an infinite product clamps to u64::MAX first.
        (grown as u64).min(self.max_capacity)
    }

    /// Tries to take `n` tokens at `now_ms`.
    ///
    /// Refills first. Returns `Ok(true)` and deducts the tokens if enough are
    /// available, otherwise `Ok(false)` with no deduction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClockSkew`] if `now_ms` is before the last refill. The
    /// limiter is not modified in that case.
    pub fn try_make_request(&mut self, n: u64, now_ms: u64) -> Result<bool> {
        if now_ms < self.last_refill_ms {
            return Err(Error::ClockSkew {
                now_ms,
                last_refill_ms: self.last_refill_ms,
            });
        }

        self.available_tokens = self.refreshed_tokens(now_ms);
        self.last_refill_ms = now_ms;

        let n = n as f64;
        if n <= self.available_tokens {
            self.available_tokens -= n;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// How long to wait before `n` tokens will be available.
    ///
    /// Returns `Some(0)` if they are available at `now_ms`, `None` if `n` is
    /// more than the capacity at `now_ms` (no amount of waiting short of a
    /// growth step can help), otherwise the wait in milliseconds rounded up.
    /// Does not modify the limiter.
    pub fn next_request_delay_ms(&self, n: u64, now_ms: u64) -> Option<u64> {
        let available = self.refreshed_tokens(now_ms);
        let needed = n as f64;
        if needed <= available {
            return Some(0);
        }

        let capacity = self.calculate_capacity(now_ms);
        if n > capacity {
            return None;
        }

        let missing = needed - available;
        Some((missing * 1000.0 / capacity as f64).ceil() as u64)
    }

    /// Tokens currently in the bucket, as of the last refill.
    pub fn available_tokens(&self) -> f64 {
        self.available_tokens
    }

    /// Time of the last refill.
    pub fn last_refill_ms(&self) -> u64 {
        self.last_refill_ms
    }

    /// The capacity ceiling.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    fn refreshed_tokens(&self, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed == 0 {
            return self.available_tokens;
        }
        let capacity = self.calculate_capacity(now_ms) as f64;
        (self.available_tokens + capacity * elapsed as f64 / 1000.0).min(capacity)
    }
}

// =============================================================================
// Tests
// =============================================================================
