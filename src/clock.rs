//! # Time Source
//!
//! The dispatch actor never reads the system clock or calls `tokio::time`
//! directly. It asks a [`Clock`] for the current time (to feed the rate
//! limiter) and for a sleep future (to wake itself after a rate-limit delay).
//!
//! Two implementations ship with the crate:
//!
//! | Clock | `now_ms()` | `sleep(d)` |
//! |-------|-----------|------------|
//! | [`SystemClock`] | ms since the clock was created (monotonic) | `tokio::time::sleep(d)` |
//! | [`VirtualClock`] | a shared counter | advances the counter by `d`, completes immediately |
//!
//! `VirtualClock` makes throttling tests deterministic and instant: a writer
//! that is denied by its limiter "sleeps" by jumping virtual time forward by
//! exactly the delay the limiter asked for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

/// An injectable source of monotonic time and delays.
///
/// # Rust Pattern: Trait Objects
///
/// The writer stores an `Arc<dyn Clock>`, so implementations must be
/// `Send + Sync`. `sleep` returns a boxed `'static` future so that it can be
/// moved into a spawned task.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since an arbitrary fixed origin. Must never decrease.
    fn now_ms(&self) -> u64;

    /// Returns a future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

// =============================================================================
// System Clock
// =============================================================================

/// Real time, measured from the moment the clock was created.
///
/// Uses Tokio's `Instant`, so a runtime with paused time pauses this clock too.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

// =============================================================================
// Virtual Clock
// =============================================================================

/// Deterministic time for tests and simulations.
///
/// Cloning shares the underlying counter, so a test can keep one clone and
/// hand another to the writer.
///
/// ```rust
/// use std::time::Duration;
/// use bulkwriter::clock::{Clock, VirtualClock};
///
/// let clock = VirtualClock::new(0);
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now_ms(), 250);
/// ```
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: Arc<AtomicU64>,
}

impl VirtualClock {
    /// Creates a clock reading `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jumps to `ms` if it is later than the current reading.
    pub fn set_ms(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.advance(duration);
        futures::future::ready(()).boxed()
    }
}

// =============================================================================
// Tests
// =============================================================================
