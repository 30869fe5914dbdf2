//! # BulkWriter - Batched Document Write Scheduler
//!
//! BulkWriter accepts a high volume of independent document writes and sends
//! them to a backend in batches. It provides:
//!
//! - **Batching**: writes are grouped up to a configurable batch size
//! - **Per-document ordering**: at most one write per document is in flight
//! - **Adaptive throttling**: a token bucket whose rate grows over time
//! - **Retries**: transient failures are retried up to a bounded attempt count
//! - **Listeners**: success and error callbacks, with retry decisions
//! - **Recursive delete**: a paced producer that deletes whole subtrees
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         BulkWriter API                          │
//! │     (create, set, update, delete, flush, close, listeners)      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ Command channel
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Dispatch Actor                            │
//! │             (single task, owns all scheduling state)            │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │  Operation  │  │    Rate     │  │  Retry + Listener       │ │
//! │  │    Queue    │  │   Limiter   │  │  Resolution             │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ BatchSubmitter::submit
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Backend                                │
//! │           (remote service, or the in-memory backend)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single resolution**: every write's handle resolves exactly once
//! 2. **No same-document overlap**: two writes to one document never share a
//!    batch or run concurrently
//! 3. **Per-document order**: writes to one document are sent in enqueue order,
//!    retries included
//! 4. **Bounded attempts**: a write is sent at most `max_attempts + 1` times
//!    unless an error listener asks for one more
//! 5. **Flush covers the past**: a flush resolves only after every write
//!    enqueued before it has resolved
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for all failure modes
//! - [`types`]: Domain types (DocumentRef, Write, Status, Timestamp, etc.)
//! - [`config`]: Writer and recursive delete configuration
//! - [`rate_limiter`]: Token bucket with scheduled capacity growth
//! - [`retry`]: Retryable status codes and listener decisions
//! - [`transport`]: Traits the backend implements
//! - [`writer`]: The writer handle and its dispatch actor
//! - [`recursive_delete`]: Watermark-paced subtree deletion
//! - [`memory`]: In-memory backend for tests and load runs

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for BulkWriter operations.
pub mod error;

/// Domain types for document writes.
///
/// Document and collection paths, the write itself, commit timestamps and
/// gRPC-style status codes.
pub mod types;

/// Time source abstraction.
///
/// The writer reads time through a [`clock::Clock`] so throttling can be
/// tested without waiting on the wall clock.
pub mod clock;

/// Writer configuration, loadable from JSON or the environment.
pub mod config;

/// Token bucket rate limiter.
pub mod rate_limiter;

/// Retry policy and error listener decisions.
pub mod retry;

/// Backend traits for committing batches and listing descendants.
pub mod transport;

mod listener;
mod queue;

/// The bulk writer and its dispatch actor.
///
/// Writes are sent to a single actor task that owns the queue, the rate
/// limiter and all bookkeeping. Callers get a [`writer::WriteHandle`] per
/// write, which resolves with the write's final outcome.
pub mod writer;

/// Recursive deletion of a collection or document subtree.
pub mod recursive_delete;

/// In-memory backend.
///
/// Implements both backend traits over a `BTreeMap`, with scripted failures
/// and fault injection for tests and the `bulk_load` binary.
pub mod memory;

// =============================================================================
// Re-exports
// =============================================================================

pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::{RecursiveDeleteConfig, ThrottleConfig, WriterConfig};
pub use error::{BulkWriteError, Error, Result};
pub use listener::{ErrorCallback, SuccessCallback};
pub use memory::InMemoryBackend;
pub use rate_limiter::RateLimiter;
pub use recursive_delete::recursive_delete;
pub use retry::{ErrorDecision, RetryPolicy};
pub use transport::{BatchResponse, BatchSubmitter, DeleteTarget, DescendantQuery};
pub use writer::{BulkWriter, Completion, MetricsSnapshot, WriteHandle};

pub use types::{
    CollectionRef, DocumentRef, Precondition, Status, StatusCode, Timestamp, Write, WriteKind,
    WriteResult,
};
