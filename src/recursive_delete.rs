//! # Recursive Delete: Watermark-Paced Producer
//!
//! Deletes every document below a collection or document by streaming their
//! names from a [`DescendantQuery`] and feeding a delete for each one into a
//! [`BulkWriter`].
//!
//! ## Pacing
//!
//! The query is paged. Each page asks for `max_pending_ops` documents. The
//! producer only asks for a page once outstanding deletes have fallen to
//! `min_pending_ops`, and stops pulling from a page while `max_pending_ops`
//! deletes are outstanding:
//!
//! ```text
//!  outstanding deletes
//!       ▲
//!   max ┤─ ─ ─ ─ ─ ─╱│─ ─ ─ ─ ─ ─ ─ ─ ─ ─╱│─ ─ ─   stop pulling
//!       │          ╱ │                  ╱ │
//!       │         ╱  │                 ╱  │
//!   min ┤─ ─ ─ ─ ╱─ ─ ╲─ ─ ─ ─ ─ ─ ─ ─╱─ ─ ╲─ ─ ─   next page
//!       │       ╱      ╲_____________╱      ╲
//!       │  page 1        page 2 (resumes       ...
//!       │                after last doc)
//!       └──────────────────────────────────────────▶ time
//! ```
//!
//! So a new page is never requested above `min_pending_ops`, and no more than
//! `max_pending_ops` deletes are ever outstanding.
//!
//! Every page starts strictly after the last document already handed to the
//! writer, so no document is deleted twice. A page that comes back shorter
//! than requested means the subtree is exhausted.
//!
//! ## Failures
//!
//! - A page stream that errors is re-requested from the same cursor, up to
//!   `max_stream_retries` consecutive failures. After that, fetching stops and
//!   the run fails with `UNAVAILABLE: failed to fetch children documents`
//!   once everything already queued has finished.
//! - Individual delete failures (including listener panics) are counted. The
//!   run still waits for every delete, then fails with
//!   [`Error::RecursiveDelete`] carrying the count and the last status seen.

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};

use crate::config::RecursiveDeleteConfig;
use crate::error::{Error, Result};
use crate::transport::{DeleteTarget, DescendantQuery};
use crate::types::{DocumentRef, Status, WriteResult};
use crate::writer::{BulkWriter, WriteHandle};

/// Running tally of delete outcomes.
#[derive(Debug, Default)]
struct Tally {
    deleted: usize,
    failed: usize,
    last_status: Option<Status>,
}

impl Tally {
    fn record(&mut self, result: Result<WriteResult>) {
        match result {
            Ok(_) => self.deleted += 1,
            Err(e) => {
                self.failed += 1;
                self.last_status = Some(e.status());
            }
        }
    }
}

/// Deletes `target` and everything below it.
///
/// Resolves once every delete issued has reached a terminal state.
///
/// # Errors
///
/// - [`Error::Closed`] if the writer is closed when the run starts, or is
///   closed while it is still issuing deletes
/// - [`Error::InvalidArgument`] if `config` is invalid
/// - [`Error::RecursiveDelete`] if any delete failed or fetching gave up
pub async fn recursive_delete(
    writer: &BulkWriter,
    query: &dyn DescendantQuery,
    target: DeleteTarget,
    config: &RecursiveDeleteConfig,
) -> Result<()> {
    config.validate()?;
    if writer.is_closed() {
        return Err(Error::Closed);
    }
    info!(subtree = %target, "starting recursive delete");

    let mut pending: FuturesUnordered<WriteHandle> = FuturesUnordered::new();
    let mut tally = Tally::default();
    let mut cursor: Option<DocumentRef> = None;
    let mut consecutive_stream_failures = 0u32;
    let mut fetch_failed = false;

    loop {
        drain_ready(&mut pending, &mut tally);
        if pending.len() > config.min_pending_ops {
            debug!(pending = pending.len(), "waiting before next page");
            wait_for_low_watermark(&mut pending, &mut tally, config.min_pending_ops).await;
        }

        let mut page = query.stream_page(&target, config.max_pending_ops, cursor.as_ref());
        let mut streamed = 0usize;
        let mut stream_error = None;

        while let Some(item) = page.next().await {
            match item {
                Ok(doc) => {
                    streamed += 1;
                    if pending.len() >= config.max_pending_ops {
                        debug!(pending = pending.len(), "pausing descendant stream");
                        wait_for_low_watermark(&mut pending, &mut tally, config.min_pending_ops).await;
                    }
                    pending.push(writer.delete(doc.clone())?);
                    cursor = Some(doc);
                }
                Err(status) => {
                    stream_error = Some(status);
                    break;
                }
            }
        }
        drop(page);

        if let Some(status) = stream_error {
            consecutive_stream_failures += 1;
            if consecutive_stream_failures > config.max_stream_retries {
                warn!(
                    subtree = %target,
                    failures = consecutive_stream_failures,
                    status = %status,
                    "giving up on fetching descendants"
                );
                fetch_failed = true;
                break;
            }
            warn!(
                subtree = %target,
                attempt = consecutive_stream_failures,
                streamed,
                status = %status,
                "descendant stream failed, resuming from cursor"
            );
            continue;
        }
        consecutive_stream_failures = 0;

        if streamed < config.max_pending_ops {
            break;
        }
    }

    if let DeleteTarget::Document(root) = &target {
        pending.push(writer.delete(root.clone())?);
    }

    while let Some(result) = pending.next().await {
        tally.record(result);
    }

    if fetch_failed {
        tally.last_status = Some(Status::unavailable("failed to fetch children documents"));
    }

    info!(
        subtree = %target,
        deleted = tally.deleted,
        failed = tally.failed,
        "recursive delete finished"
    );

    match tally.last_status {
        Some(last_status) if tally.failed > 0 || fetch_failed => Err(Error::RecursiveDelete {
            failed: tally.failed,
            last_status,
        }),
        _ => Ok(()),
    }
}

/// Records every delete that has already finished, without waiting.
fn drain_ready(pending: &mut FuturesUnordered<WriteHandle>, tally: &mut Tally) {
    while let Some(Some(result)) = pending.next().now_or_never() {
        tally.record(result);
    }
}

/// Waits for deletes to finish until at most `min` are outstanding.
async fn wait_for_low_watermark(
    pending: &mut FuturesUnordered<WriteHandle>,
    tally: &mut Tally,
    min: usize,
) {
    while pending.len() > min {
        match pending.next().await {
            Some(result) => tally.record(result),
            None => break,
        }
    }
}

impl BulkWriter {
    /// Convenience wrapper for [`recursive_delete`] with default pacing.
    pub async fn recursive_delete(
        &self,
        query: &dyn DescendantQuery,
        target: DeleteTarget,
    ) -> Result<()> {
        recursive_delete(self, query, target, &RecursiveDeleteConfig::default()).await
    }
}
