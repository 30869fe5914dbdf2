//! # Error Handling for the Bulk Writer
//!
//! This module defines the error types used throughout the crate. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which keeps the
//! public signatures short: everything returns [`Result<T>`].
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Validation | Writer closed, bad batch size | Fix the call site |
//! | Permanent write | `NOT_FOUND`, retries exhausted | Inspect [`BulkWriteError`] |
//! | Listener | Callback panicked | Fix the callback |
//! | Aggregate | Some recursive deletes failed | Inspect count + last status |
//! | Internal | Actor gone, no runtime | Log and investigate |

use thiserror::Error;

use crate::types::{DocumentRef, Status, StatusCode, WriteKind};

// =============================================================================
// Permanent Write Failure
// =============================================================================

/// A write that reached a terminal failure.
///
/// Carries everything a caller needs to decide what to do next: which document,
/// which kind of write, the last status returned by the backend and how many
/// attempts were made before giving up.
///
/// This is also the value handed to error listeners, which may ask for one more
/// attempt via [`ErrorDecision::RetryOnce`](crate::retry::ErrorDecision).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteError {
    /// The document the write targeted.
    pub document: DocumentRef,

    /// The kind of write.
    pub kind: WriteKind,

    /// The last status observed for this write.
    pub status: Status,

    /// Number of attempts that failed, including the last one.
    pub failed_attempts: u32,
}

impl std::fmt::Display for BulkWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of '{}' failed after {} attempt(s): {}",
            self.kind, self.document, self.failed_attempts, self.status
        )
    }
}

impl std::error::Error for BulkWriteError {}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in bulk writer operations.
///
/// # Rust Pattern: Enum Variants
///
/// Each variant represents a distinct failure mode. The `#[error(...)]` attribute
/// defines the `Display` message shown when the error is printed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Validation Errors (synchronous, no network attempt)
    // =========================================================================

    /// A mutating call was made after `close()`.
    #[error("bulk writer has already been closed")]
    Closed,

    /// An argument or configuration value is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The rate limiter was asked about a time before its last refill.
    ///
    /// Time sources handed to the writer must be monotonic. This error is
    /// returned without touching the limiter's state.
    #[error("request time {now_ms}ms is before the last token refill time {last_refill_ms}ms")]
    ClockSkew {
        /// The time passed in.
        now_ms: u64,
        /// The limiter's last refill time.
        last_refill_ms: u64,
    },

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    // =========================================================================
    // Operation Failures
    // =========================================================================

    /// A write failed permanently.
    #[error(transparent)]
    Write(BulkWriteError),

    /// A success or error listener panicked while handling this write.
    ///
    /// The writer keeps running; only the affected operation's result carries
    /// this error.
    #[error("listener panicked: {message}")]
    ListenerPanicked {
        /// The panic payload, if it was a string.
        message: String,
    },

    /// Some deletes issued by a recursive delete failed.
    #[error("{failed} {} failed. {}", delete_noun(.failed), status_message(.last_status))]
    RecursiveDelete {
        /// Number of deletes that failed.
        failed: usize,
        /// The most recently observed failure status.
        last_status: Status,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// The dispatch actor is gone (all handles dropped, or it panicked).
    #[error("bulk writer has shut down")]
    Shutdown,

    /// No Tokio runtime was available to spawn the dispatch actor on.
    #[error("runtime error: {0}")]
    Runtime(String),
}

fn delete_noun(failed: &usize) -> &'static str {
    if *failed == 1 {
        "delete"
    } else {
        "deletes"
    }
}

fn status_message(status: &Status) -> &str {
    &status.message
}

impl Error {
    /// Maps any error to a status, for consumers that aggregate failures.
    pub fn status(&self) -> Status {
        match self {
            Error::Write(e) => e.status.clone(),
            Error::RecursiveDelete { last_status, .. } => last_status.clone(),
            Error::Closed => Status::new(StatusCode::FailedPrecondition, self.to_string()),
            Error::InvalidArgument(_) | Error::Config(_) => {
                Status::new(StatusCode::InvalidArgument, self.to_string())
            }
            Error::ClockSkew { .. } => Status::new(StatusCode::Internal, self.to_string()),
            Error::ListenerPanicked { .. } => Status::new(StatusCode::Unknown, self.to_string()),
            Error::Shutdown | Error::Runtime(_) => {
                Status::new(StatusCode::Cancelled, self.to_string())
            }
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
