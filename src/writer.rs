//! # Bulk Writer: Throttled, Retrying Batch Dispatch
//!
//! This module implements the write scheduler. Callers enqueue independent
//! writes; a single dispatch actor groups them into batches, asks the rate
//! limiter for permission, sends each batch through a
//! [`BatchSubmitter`](crate::transport::BatchSubmitter) and resolves every
//! write's own handle when it reaches a terminal state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Callers (any thread/task)                     │
//! │   writer.set(..)   writer.delete(..)   writer.flush()   close()   │
//! └──────────────┬───────────────────────────────────────────────────┘
//!                │ Command (unbounded mpsc, never blocks)
//!                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 Dispatch actor (one Tokio task)                   │
//! │                                                                   │
//! │  OperationQueue ──select_batch──▶ RateLimiter ──allowed──┐       │
//! │        ▲                             │ denied             │       │
//! │        │ retry (tail)                ▼                    ▼       │
//! │        │                      clock.sleep(delay)   spawn submit   │
//! │        │                             │ Wake              │       │
//! │        └───────── BatchCompleted ◀───┴───────────────────┘       │
//! └──────────────┬───────────────────────────────────────────────────┘
//!                │ outcomes
//!                ▼
//!     WriteHandle resolves   (listeners first, via spawn_blocking)
//! ```
//!
//! ## Rust Pattern: Single-Writer Actor
//!
//! All scheduling state (pending queue, in-flight documents, limiter, flush
//! waiters) is owned by one task. Callers and background tasks only send it
//! `Command`s. There are no locks around the queue, and the invariants in
//! the `queue` module can be checked by reading one function at a time.
//!
//! Like a group-commit loop, the actor waits for one command and then drains
//! whatever else is already queued before it runs a dispatch pass, so a burst
//! of enqueues becomes a few full batches rather than many small ones.
//!
//! ## Operation Lifecycle
//!
//! ```text
//! Pending ──▶ Dispatched ──▶ Succeeded
//!    ▲             │
//!    │             ├──▶ RetryPending (retryable, budget left) ──┐
//!    │             │                                            │
//!    └─────────────┼────────────────────────────────────────────┘
//!                  └──▶ PermanentlyFailed (error listeners may ask for one more try)
//! ```
//!
//! ## Invariants
//!
//! - No batch contains two writes to one document, or a write to a document
//!   that is already on the wire
//! - Writes to one document are applied in enqueue order, retries included
//! - A write is attempted at most `max_attempts + 1` times
//! - `flush()` waits for exactly the writes enqueued before it
//! - Once closed, nothing new is accepted and the queue only drains

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::WriterConfig;
use crate::error::{BulkWriteError, Error, Result};
use crate::listener::{self, ErrorListener, Listeners, SuccessListener};
use crate::queue::{Operation, OperationQueue};
use crate::rate_limiter::RateLimiter;
use crate::retry::{ErrorDecision, RetryPolicy};
use crate::transport::{BatchResponse, BatchSubmitter};
use crate::types::{
    DocumentRef, Precondition, Status, Timestamp, Write, WriteKind, WriteResult,
};

/// Delay before retrying a dispatch pass after the limiter reported clock skew.
const CLOCK_SKEW_BACKOFF: Duration = Duration::from_millis(1);

// =============================================================================
// Commands
// =============================================================================

/// Messages processed by the dispatch actor.
enum Command {
    Enqueue {
        write: Write,
        responder: oneshot::Sender<Result<WriteResult>>,
    },
    Flush {
        response: oneshot::Sender<()>,
    },
    Close {
        response: oneshot::Sender<()>,
    },
    SetMaxBatchSize(usize),
    AddSuccessListener(SuccessListener),
    AddErrorListener(ErrorListener),

    /// A submit call returned.
    BatchCompleted {
        batch: Vec<Operation>,
        outcome: std::result::Result<BatchResponse, Status>,
    },
    /// An error listener asked for one more attempt.
    Retry(Operation),
    /// A listener task resolved this operation's handle.
    Settled(u64),
    /// A rate-limit delay elapsed.
    Wake,
    /// Every `BulkWriter` handle is gone.
    Shutdown,
}

// =============================================================================
// Metrics
// =============================================================================

#[derive(Debug, Default)]
struct Metrics {
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    batches_sent: AtomicU64,
    deferrals: AtomicU64,
    pending: AtomicU64,
}

impl Metrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Writes accepted.
    pub enqueued: u64,
    /// Writes that resolved successfully.
    pub succeeded: u64,
    /// Writes that resolved with an error.
    pub failed: u64,
    /// Re-enqueues, automatic or listener-requested.
    pub retried: u64,
    /// Submit calls made.
    pub batches_sent: u64,
    /// Dispatch passes postponed by the rate limiter.
    pub deferrals: u64,
    /// Writes not yet resolved.
    pub pending: u64,
}

// =============================================================================
// Handles
// =============================================================================

/// Resolves to the outcome of one write.
///
/// Dropping it does not cancel the write.
#[must_use = "dropping a WriteHandle discards the write's outcome, not the write"]
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<WriteResult>>,
}

impl Future for WriteHandle {
    type Output = Result<WriteResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Shutdown)))
    }
}

/// Resolves when a `flush()` or `close()` has drained.
///
/// Never carries individual write errors; those stay on their own handles.
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<()>,
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::Shutdown))
    }
}

// =============================================================================
// BulkWriter (public handle)
// =============================================================================

struct Shared {
    tx: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
    runtime: Handle,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // The actor drains outstanding work before it exits.
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Handle to a running bulk writer.
///
/// Cheap to clone; all clones feed the same dispatch actor. When the last
/// clone is dropped the actor finishes outstanding work and exits.
///
/// Closing is ordered by the actor. A write enqueued from one clone while
/// another clone closes either lands before the close (and the close waits
/// for it) or fails through its own handle with [`Error::Closed`].
///
/// # Example
///
/// ```rust,ignore
/// let writer = BulkWriter::new(submitter, WriterConfig::default())?;
/// let a = writer.set("users/alice", encode(&alice))?;
/// let b = writer.delete("users/bob")?;
/// writer.close()?.await?;
/// println!("alice written at {}", a.await?.write_time);
/// ```
#[derive(Clone)]
pub struct BulkWriter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BulkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkWriter")
            .field("closed", &self.is_closed())
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl BulkWriter {
    /// Starts a writer on the current Tokio runtime, using real time.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the config is invalid
    /// - [`Error::Runtime`] if called outside a Tokio runtime
    pub fn new(submitter: Arc<dyn BatchSubmitter>, config: WriterConfig) -> Result<Self> {
        Self::with_clock(submitter, config, Arc::new(SystemClock::new()))
    }

    /// Starts a writer with an injected time source.
    pub fn with_clock(
        submitter: Arc<dyn BatchSubmitter>,
        config: WriterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("bulk writer needs a Tokio runtime: {}", e)))?;

        let (limiter, max_batch_size) = config.build_limiter(clock.now_ms())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::default());

        let dispatcher = Dispatcher {
            submitter,
            clock,
            limiter,
            queue: OperationQueue::new(),
            max_batch_size,
            max_attempts: config.max_attempts,
            retry: config.retry,
            listeners: Listeners::default(),
            tx: tx.clone(),
            metrics: Arc::clone(&metrics),
            next_id: 0,
            unsettled: BTreeSet::new(),
            flush_waiters: Vec::new(),
            in_flight_batches: 0,
            wake_pending: false,
            closed: false,
            shutting_down: false,
        };
        runtime.spawn(dispatcher.run(rx));

        debug!(max_batch_size, max_attempts = config.max_attempts, "bulk writer started");

        Ok(Self {
            shared: Arc::new(Shared {
                tx,
                closed: AtomicBool::new(false),
                metrics,
                runtime,
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Creates a document. Fails with `ALREADY_EXISTS` if it exists.
    pub fn create(&self, document: impl Into<DocumentRef>, data: Vec<u8>) -> Result<WriteHandle> {
        let write = Write::new(document.into(), WriteKind::Create, data)
            .with_precondition(Precondition::Exists(false));
        self.write(write)
    }

    /// Overwrites or creates a document.
    pub fn set(&self, document: impl Into<DocumentRef>, data: Vec<u8>) -> Result<WriteHandle> {
        self.write(Write::new(document.into(), WriteKind::Set, data))
    }

    /// Updates an existing document. Fails with `NOT_FOUND` if it is missing.
    pub fn update(&self, document: impl Into<DocumentRef>, data: Vec<u8>) -> Result<WriteHandle> {
        self.update_with(document, data, Precondition::Exists(true))
    }

    /// Updates a document under an explicit precondition.
    pub fn update_with(
        &self,
        document: impl Into<DocumentRef>,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<WriteHandle> {
        let write = Write::new(document.into(), WriteKind::Update, data)
            .with_precondition(precondition);
        self.write(write)
    }

    /// Deletes a document. Deleting a missing document succeeds.
    pub fn delete(&self, document: impl Into<DocumentRef>) -> Result<WriteHandle> {
        self.write(Write::new(document.into(), WriteKind::Delete, Vec::new()))
    }

    /// Deletes a document under a precondition.
    pub fn delete_with(
        &self,
        document: impl Into<DocumentRef>,
        precondition: Precondition,
    ) -> Result<WriteHandle> {
        let write = Write::new(document.into(), WriteKind::Delete, Vec::new())
            .with_precondition(precondition);
        self.write(write)
    }

    /// Enqueues an arbitrary write.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if `close()` has been called. Nothing is sent.
    ///
    /// A write that races a `close()` on another clone may pass this check
    /// and still reach the dispatcher after the close. It is then rejected
    /// there, and the returned handle resolves to `Err(Closed)`. It is never
    /// sent, and the close does not wait for it.
    pub fn write(&self, write: Write) -> Result<WriteHandle> {
        self.verify_not_closed()?;
        let (responder, rx) = oneshot::channel();
        self.send(Command::Enqueue { write, responder })?;
        Ok(WriteHandle { rx })
    }

    // -------------------------------------------------------------------------
    // Flush / Close
    // -------------------------------------------------------------------------

    /// Resolves once every write enqueued before this call has resolved.
    pub fn flush(&self) -> Result<Completion> {
        self.verify_not_closed()?;
        let (response, rx) = oneshot::channel();
        self.send(Command::Flush { response })?;
        Ok(Completion { rx })
    }

    /// Stops accepting writes, then behaves like [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] on the second call.
    pub fn close(&self) -> Result<Completion> {
        self.shared
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Closed)?;
        let (response, rx) = oneshot::channel();
        self.send(Command::Close { response })?;
        Ok(Completion { rx })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Changes the batch size for batches formed after this call.
    pub fn set_max_batch_size(&self, size: usize) -> Result<()> {
        self.verify_not_closed()?;
        if size < 1 {
            return Err(Error::InvalidArgument(
                "max batch size must be at least 1".to_string(),
            ));
        }
        self.send(Command::SetMaxBatchSize(size))
    }

    /// Registers a success listener on the writer's runtime.
    pub fn add_success_listener<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&DocumentRef, &WriteResult) + Send + Sync + 'static,
    {
        self.add_success_listener_on(self.shared.runtime.clone(), callback)
    }

    /// Registers a success listener that runs on `executor`.
    pub fn add_success_listener_on<F>(&self, executor: Handle, callback: F) -> Result<()>
    where
        F: Fn(&DocumentRef, &WriteResult) + Send + Sync + 'static,
    {
        self.send(Command::AddSuccessListener(SuccessListener::new(
            executor, callback,
        )))
    }

    /// Registers an error listener on the writer's runtime.
    pub fn add_error_listener<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&BulkWriteError) -> ErrorDecision + Send + Sync + 'static,
    {
        self.add_error_listener_on(self.shared.runtime.clone(), callback)
    }

    /// Registers an error listener that runs on `executor`.
    pub fn add_error_listener_on<F>(&self, executor: Handle, callback: F) -> Result<()>
    where
        F: Fn(&BulkWriteError) -> ErrorDecision + Send + Sync + 'static,
    {
        self.send(Command::AddErrorListener(ErrorListener::new(executor, callback)))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    fn verify_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.shared.tx.send(command).map_err(|_| Error::Shutdown)
    }
}

// =============================================================================
// Dispatch Actor
// =============================================================================

struct Dispatcher {
    submitter: Arc<dyn BatchSubmitter>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    queue: OperationQueue,
    max_batch_size: usize,
    max_attempts: u32,
    retry: RetryPolicy,
    listeners: Listeners,

    /// For background tasks to report back.
    tx: mpsc::UnboundedSender<Command>,
    metrics: Arc<Metrics>,

    next_id: u64,
    /// Ids of operations whose handle has not resolved yet.
    unsettled: BTreeSet<u64>,
    /// `(first id not covered, response)` per outstanding flush or close.
    flush_waiters: Vec<(u64, oneshot::Sender<()>)>,
    in_flight_batches: usize,
    wake_pending: bool,
    closed: bool,
    shutting_down: bool,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
            while let Ok(command) = rx.try_recv() {
                self.handle(command);
            }

            self.dispatch();
            self.metrics
                .pending
                .store(self.unsettled.len() as u64, Ordering::Relaxed);
            self.resolve_flush_waiters();

            if self.shutting_down && self.is_idle() {
                break;
            }
        }
        info!(enqueued = self.next_id, "bulk writer stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { write, responder } => {
                if self.closed {
                    let _ = responder.send(Err(Error::Closed));
                    return;
                }
                let id = self.next_id;
                self.next_id += 1;
                self.unsettled.insert(id);
                Metrics::incr(&self.metrics.enqueued);
                self.queue.push_back(Operation {
                    id,
                    write,
                    attempts: 0,
                    responder,
                });
            }
            Command::Flush { response } => {
                self.flush_waiters.push((self.next_id, response));
            }
            Command::Close { response } => {
                info!(pending = self.unsettled.len(), "closing bulk writer");
                self.closed = true;
                self.flush_waiters.push((self.next_id, response));
            }
            Command::SetMaxBatchSize(size) => {
                self.max_batch_size = size;
            }
            Command::AddSuccessListener(l) => self.listeners.add_success(l),
            Command::AddErrorListener(l) => self.listeners.add_error(l),
            Command::BatchCompleted { batch, outcome } => {
                self.complete_batch(batch, outcome);
            }
            Command::Retry(op) => {
                self.queue.push_back(op);
            }
            Command::Settled(id) => {
                self.unsettled.remove(&id);
            }
            Command::Wake => {
                self.wake_pending = false;
            }
            Command::Shutdown => {
                debug!(pending = self.unsettled.len(), "all writer handles dropped");
                self.shutting_down = true;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.unsettled.is_empty() && self.in_flight_batches == 0 && self.queue.pending_len() == 0
    }

    // -------------------------------------------------------------------------
    // Batch formation and sending
    // -------------------------------------------------------------------------

    /// Sends as many batches as the queue and the limiter allow right now.
    fn dispatch(&mut self) {
        if self.wake_pending {
            return;
        }
        loop {
            let now = self.clock.now_ms();
            let capacity = usize::try_from(self.limiter.calculate_capacity(now)).unwrap_or(usize::MAX);
            let limit = self.max_batch_size.min(capacity).max(1);

            let size = self.queue.eligible_len(limit);
            if size == 0 {
                return;
            }

            match self.limiter.try_make_request(size as u64, now) {
                Ok(true) => {
                    let batch = self.queue.select_batch(limit);
                    self.send_batch(batch);
                }
                Ok(false) => {
                    let delay = self
                        .limiter
                        .next_request_delay_ms(size as u64, now)
                        .unwrap_or(1)
                        .max(1);
                    debug!(batch_size = size, delay_ms = delay, "rate limited, deferring batch");
                    Metrics::incr(&self.metrics.deferrals);
                    self.schedule_wake(Duration::from_millis(delay));
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "rate limiter rejected request time");
                    self.schedule_wake(CLOCK_SKEW_BACKOFF);
                    return;
                }
            }
        }
    }

    fn schedule_wake(&mut self, delay: Duration) {
        if self.wake_pending {
            return;
        }
        self.wake_pending = true;
        let sleep = self.clock.sleep(delay);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep.await;
            let _ = tx.send(Command::Wake);
        });
    }

    fn send_batch(&mut self, batch: Vec<Operation>) {
        self.in_flight_batches += 1;
        Metrics::incr(&self.metrics.batches_sent);

        let writes: Vec<Write> = batch.iter().map(|op| op.write.clone()).collect();
        debug!(batch_size = writes.len(), in_flight = self.in_flight_batches, "sending batch");

        let submitter = Arc::clone(&self.submitter);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            // A panicking submitter still has to hand the batch back, or its
            // documents stay in flight and flush never resolves.
            let outcome = AssertUnwindSafe(submitter.submit(writes))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = listener::panic_message(payload);
                    warn!(panic = %message, "batch submit panicked");
                    Err(Status::internal(format!("batch submit panicked: {}", message)))
                });
            let _ = tx.send(Command::BatchCompleted { batch, outcome });
        });
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn complete_batch(
        &mut self,
        batch: Vec<Operation>,
        outcome: std::result::Result<BatchResponse, Status>,
    ) {
        self.in_flight_batches = self.in_flight_batches.saturating_sub(1);

        let results: BatchResponse = match outcome {
            Ok(results) if results.len() == batch.len() => results,
            Ok(results) => {
                let status = Status::internal(format!(
                    "expected {} write results, got {}",
                    batch.len(),
                    results.len()
                ));
                vec![Err(status); batch.len()]
            }
            Err(status) => {
                warn!(batch_size = batch.len(), status = %status, "batch submit failed");
                vec![Err(status); batch.len()]
            }
        };
        debug!(batch_size = batch.len(), "batch completed");

        for (op, result) in batch.into_iter().zip(results) {
            self.queue.release(op.document());
            match result {
                Ok(write_time) => self.complete_success(op, write_time),
                Err(status) => self.complete_failure(op, status),
            }
        }
    }

    fn complete_success(&mut self, op: Operation, write_time: Timestamp) {
        let result = WriteResult { write_time };

        let Some(listeners) = self.listeners.success_snapshot() else {
            Metrics::incr(&self.metrics.succeeded);
            let _ = op.responder.send(Ok(result));
            self.unsettled.remove(&op.id);
            return;
        };

        let tx = self.tx.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let outcome = listener::notify_success(&listeners, &op.write.document, result)
                .await
                .map(|()| result);
            match outcome {
                Ok(_) => Metrics::incr(&metrics.succeeded),
                Err(_) => Metrics::incr(&metrics.failed),
            }
            let _ = op.responder.send(outcome);
            let _ = tx.send(Command::Settled(op.id));
        });
    }

    fn complete_failure(&mut self, mut op: Operation, status: Status) {
        if self.retry.is_retryable(status.code) && op.attempts < self.max_attempts {
            op.attempts += 1;
            warn!(
                document = %op.document(),
                attempt = op.attempts,
                status = %status,
                "retrying write"
            );
            Metrics::incr(&self.metrics.retried);
            self.queue.push_back(op);
            return;
        }

        let error = BulkWriteError {
            document: op.write.document.clone(),
            kind: op.write.kind,
            status,
            failed_attempts: op.attempts + 1,
        };
        debug!(error = %error, "write failed permanently");

        let Some(listeners) = self.listeners.error_snapshot() else {
            Metrics::incr(&self.metrics.failed);
            let _ = op.responder.send(Err(Error::Write(error)));
            self.unsettled.remove(&op.id);
            return;
        };

        let max_attempts = self.max_attempts;
        let tx = self.tx.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let id = op.id;
            let decision = listener::notify_error(&listeners, &error).await;
            let outcome = match decision {
                Ok(ErrorDecision::RetryOnce) if op.attempts < max_attempts => {
                    op.attempts += 1;
                    Metrics::incr(&metrics.retried);
                    let _ = tx.send(Command::Retry(op));
                    return;
                }
                Ok(_) => Err(Error::Write(error)),
                Err(panicked) => Err(panicked),
            };
            Metrics::incr(&metrics.failed);
            let _ = op.responder.send(outcome);
            let _ = tx.send(Command::Settled(id));
        });
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    fn resolve_flush_waiters(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }
        let oldest = self.unsettled.first().copied();
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flush_waiters)
            .into_iter()
            .partition(|(upto, _)| oldest.map_or(true, |id| id >= *upto));
        self.flush_waiters = waiting;
        for (_, response) in done {
            let _ = response.send(());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::memory::InMemoryBackend;
    use crate::types::StatusCode;

    fn writer(backend: &Arc<InMemoryBackend>, config: WriterConfig) -> BulkWriter {
        BulkWriter::with_clock(backend.clone(), config, Arc::new(VirtualClock::new(0))).unwrap()
    }

    #[tokio::test]
    async fn test_single_write_resolves() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());

        let handle = writer.set("c/a", b"hello".to_vec()).unwrap();
        let result = handle.await.unwrap();
        assert!(result.write_time > Timestamp::ZERO);
        assert_eq!(backend.document("c/a"), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_flush_on_empty_writer_resolves_without_calls() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());

        writer.flush().unwrap().await.unwrap();
        assert_eq!(backend.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_calls_after_close_fail_synchronously() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());

        writer.close().unwrap().await.unwrap();
        assert_eq!(writer.set("c/a", Vec::new()).unwrap_err(), Error::Closed);
        assert_eq!(writer.delete("c/a").unwrap_err(), Error::Closed);
        assert_eq!(writer.flush().unwrap_err(), Error::Closed);
        assert_eq!(writer.close().unwrap_err(), Error::Closed);
        assert_eq!(writer.set_max_batch_size(5).unwrap_err(), Error::Closed);
        assert_eq!(backend.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_batch_size() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());
        assert!(matches!(
            writer.set_max_batch_size(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let backend = Arc::new(InMemoryBackend::new());
        let err = BulkWriter::new(backend, WriterConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_retried() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());

        let err = writer.update("c/missing", b"x".to_vec()).unwrap().await.unwrap_err();
        match err {
            Error::Write(e) => {
                assert_eq!(e.status.code, StatusCode::NotFound);
                assert_eq!(e.failed_attempts, 1);
                assert_eq!(e.kind, WriteKind::Update);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(backend.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());

        let ok = writer.set("c/a", Vec::new()).unwrap();
        let bad = writer.update("c/b", Vec::new()).unwrap();
        writer.close().unwrap().await.unwrap();
        ok.await.unwrap();
        bad.await.unwrap_err();

        let m = writer.metrics();
        assert_eq!(m.enqueued, 2);
        assert_eq!(m.succeeded, 1);
        assert_eq!(m.failed, 1);
        assert_eq!(m.pending, 0);
        assert!(m.batches_sent >= 1);
    }

    #[tokio::test]
    async fn test_dropping_writer_still_completes_writes() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = writer(&backend, WriterConfig::default());

        let handle = writer.set("c/a", b"v".to_vec()).unwrap();
        drop(writer);
        handle.await.unwrap();
        assert_eq!(backend.document("c/a"), Some(b"v".to_vec()));
    }

    /// Panics on its first batch, then forwards to the backend.
    struct PanicsOnce {
        inner: Arc<InMemoryBackend>,
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BatchSubmitter for PanicsOnce {
        async fn submit(&self, writes: Vec<Write>) -> std::result::Result<BatchResponse, Status> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("connection pool poisoned");
            }
            self.inner.submit(writes).await
        }
    }

    #[tokio::test]
    async fn test_submit_panic_fails_batch_and_flush_resolves() {
        let backend = Arc::new(InMemoryBackend::new());
        let submitter = Arc::new(PanicsOnce {
            inner: Arc::clone(&backend),
            tripped: AtomicBool::new(false),
        });
        let writer =
            BulkWriter::with_clock(submitter, WriterConfig::default(), Arc::new(VirtualClock::new(0)))
                .unwrap();

        let a = writer.set("c/a", Vec::new()).unwrap();
        let b = writer.set("c/b", Vec::new()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), writer.flush().unwrap())
            .await
            .expect("flush hung after a submit panic")
            .unwrap();

        for handle in [a, b] {
            match handle.await.unwrap_err() {
                Error::Write(e) => {
                    assert_eq!(e.status.code, StatusCode::Internal);
                    assert!(e.status.message.contains("connection pool poisoned"));
                    assert_eq!(e.failed_attempts, 1);
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        // The documents were released, so later writes to them go through.
        writer.set("c/a", b"v".to_vec()).unwrap().await.unwrap();
        assert_eq!(backend.document("c/a"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_submit_panic_is_retried_when_internal_is_retryable() {
        let backend = Arc::new(InMemoryBackend::new());
        let submitter = Arc::new(PanicsOnce {
            inner: Arc::clone(&backend),
            tripped: AtomicBool::new(false),
        });
        let config = WriterConfig {
            retry: RetryPolicy::new([StatusCode::Internal]),
            ..WriterConfig::default()
        };
        let writer = BulkWriter::with_clock(submitter, config, Arc::new(VirtualClock::new(0))).unwrap();

        writer.set("c/a", b"v".to_vec()).unwrap().await.unwrap();
        writer.close().unwrap().await.unwrap();

        assert_eq!(backend.attempts("c/a"), 1);
        assert_eq!(writer.metrics().retried, 1);
    }
}
