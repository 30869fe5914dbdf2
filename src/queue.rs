//! # Pending Queue and Batch Formation
//!
//! Holds operations that are waiting to be sent, and the set of documents that
//! currently have a write on the wire.
//!
//! ```text
//!   by_document                          ready (FIFO)     in_flight
//!  ┌───────┬───────────────┐            ┌───┬───┬───┐     ┌───────┐
//!  │ doc A │ #4, #8        │            │ A │ C │ D │     │ doc B │
//!  │ doc B │ #5            │            └───┴───┴───┘     └───────┘
//!  │ doc C │ #6            │
//!  │ doc D │ #2, #7        │            select_batch(10) → [#4 A, #6 C, #2 D]
//!  └───────┴───────────────┘
//! ```
//!
//! Each document's pending operations are kept ordered by id. A document sits
//! in `ready` exactly when it has pending operations and nothing in flight, so
//! forming a batch pops documents off `ready` and takes the lowest id from
//! each. Nothing scans the whole queue.
//!
//! ## Invariants
//!
//! - A batch never contains two operations for the same document
//! - A batch never contains an operation for an in-flight document
//! - For each document, only the pending operation with the lowest id is
//!   eligible. A retried operation keeps its id, so it still goes out before
//!   later writes to the same document.
//! - Documents become eligible in the order they became ready

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{DocumentRef, Write, WriteResult};

/// One write waiting for (or between) attempts.
#[derive(Debug)]
pub(crate) struct Operation {
    /// Assigned in enqueue order; never reused.
    pub id: u64,
    pub write: Write,
    /// Attempts that have already failed.
    pub attempts: u32,
    pub responder: oneshot::Sender<Result<WriteResult>>,
}

impl Operation {
    pub fn document(&self) -> &DocumentRef {
        &self.write.document
    }
}

/// Pending operations plus in-flight document bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    by_document: HashMap<DocumentRef, BTreeMap<u64, Operation>>,
    ready: VecDeque<DocumentRef>,
    in_flight: HashSet<DocumentRef>,
    pending: usize,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operation. A retry keeps its place ahead of later writes to
    /// the same document.
    pub fn push_back(&mut self, op: Operation) {
        let doc = op.document().clone();
        let ops = self.by_document.entry(doc.clone()).or_default();
        let was_idle = ops.is_empty();
        ops.insert(op.id, op);
        self.pending += 1;

        if was_idle && !self.in_flight.contains(&doc) {
            self.ready.push_back(doc);
        }
    }

    /// Number of operations [`select_batch`](Self::select_batch) would return.
    pub fn eligible_len(&self, limit: usize) -> usize {
        self.ready.len().min(limit)
    }

    /// Removes and returns up to `limit` eligible operations and marks their
    /// documents in flight until [`release`](Self::release).
    ///
    /// Returns an empty vector if nothing is eligible.
    pub fn select_batch(&mut self, limit: usize) -> Vec<Operation> {
        let size = self.eligible_len(limit);
        let mut batch = Vec::with_capacity(size);

        for doc in self.ready.drain(..size) {
            let Some(ops) = self.by_document.get_mut(&doc) else {
                continue;
            };
            if let Some((_, op)) = ops.pop_first() {
                batch.push(op);
            }
            if ops.is_empty() {
                self.by_document.remove(&doc);
            }
            self.in_flight.insert(doc);
        }

        self.pending -= batch.len();
        batch
    }

    /// Ends the in-flight period of `doc`; its next pending write, if any,
    /// becomes eligible.
    pub fn release(&mut self, doc: &DocumentRef) {
        if !self.in_flight.remove(doc) {
            return;
        }
        if self.by_document.contains_key(doc) {
            self.ready.push_back(doc.clone());
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WriteKind;

    fn op(id: u64, doc: &str) -> Operation {
        let (tx, _rx) = oneshot::channel();
        Operation {
            id,
            write: Write::new(DocumentRef::new(doc), WriteKind::Set, Vec::new()),
            attempts: 0,
            responder: tx,
        }
    }

    fn ids(batch: &[Operation]) -> Vec<u64> {
        batch.iter().map(|op| op.id).collect()
    }

    #[test]
    fn test_select_respects_limit_and_order() {
        let mut queue = OperationQueue::new();
        for i in 0..5 {
            queue.push_back(op(i, &format!("c/{}", i)));
        }

        let batch = queue.select_batch(3);
        assert_eq!(ids(&batch), vec![0, 1, 2]);
        assert_eq!(queue.pending_len(), 2);

        let batch = queue.select_batch(3);
        assert_eq!(ids(&batch), vec![3, 4]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_same_document_waits_for_release() {
        let mut queue = OperationQueue::new();
        queue.push_back(op(0, "c/a"));
        queue.push_back(op(1, "c/a"));
        queue.push_back(op(2, "c/b"));

        let batch = queue.select_batch(10);
        assert_eq!(ids(&batch), vec![0, 2]);
        assert!(queue.select_batch(10).is_empty());

        queue.release(&DocumentRef::new("c/a"));
        assert_eq!(ids(&queue.select_batch(10)), vec![1]);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_in_flight_documents_are_skipped() {
        let mut queue = OperationQueue::new();
        queue.push_back(op(0, "c/a"));
        assert_eq!(ids(&queue.select_batch(10)), vec![0]);

        queue.push_back(op(1, "c/a"));
        queue.push_back(op(2, "c/b"));
        assert_eq!(ids(&queue.select_batch(10)), vec![2]);
        assert!(queue.select_batch(10).is_empty());

        queue.release(&DocumentRef::new("c/a"));
        assert_eq!(ids(&queue.select_batch(10)), vec![1]);
    }

    #[test]
    fn test_retried_operation_keeps_its_turn() {
        let mut queue = OperationQueue::new();
        // #3 is a later write to the same document; #1 comes back as a retry.
        queue.push_back(op(3, "c/a"));
        queue.push_back(op(4, "c/b"));
        queue.push_back(op(1, "c/a"));

        assert_eq!(ids(&queue.select_batch(10)), vec![1, 4]);
        assert!(queue.select_batch(10).is_empty());

        queue.release(&DocumentRef::new("c/a"));
        assert_eq!(ids(&queue.select_batch(10)), vec![3]);
    }

    #[test]
    fn test_retry_after_release_goes_first() {
        let mut queue = OperationQueue::new();
        queue.push_back(op(0, "c/a"));
        let mut batch = queue.select_batch(10);
        queue.push_back(op(1, "c/a"));

        // Completion releases the document, then re-queues the failed write.
        queue.release(&DocumentRef::new("c/a"));
        queue.push_back(batch.remove(0));

        assert_eq!(ids(&queue.select_batch(10)), vec![0]);
        queue.release(&DocumentRef::new("c/a"));
        assert_eq!(ids(&queue.select_batch(10)), vec![1]);
    }

    #[test]
    fn test_release_of_idle_document_is_ignored() {
        let mut queue = OperationQueue::new();
        queue.push_back(op(0, "c/a"));
        queue.release(&DocumentRef::new("c/a"));
        queue.release(&DocumentRef::new("c/zzz"));

        assert_eq!(queue.eligible_len(10), 1);
        assert_eq!(ids(&queue.select_batch(10)), vec![0]);
    }

    #[test]
    fn test_eligible_len_does_not_remove() {
        let mut queue = OperationQueue::new();
        queue.push_back(op(0, "c/a"));
        queue.push_back(op(1, "c/a"));
        queue.push_back(op(2, "c/b"));

        assert_eq!(queue.eligible_len(10), 2);
        assert_eq!(queue.eligible_len(1), 1);
        assert_eq!(queue.pending_len(), 3);
    }

    #[test]
    fn test_empty_and_zero_limit() {
        let mut queue = OperationQueue::new();
        assert!(queue.select_batch(5).is_empty());
        queue.push_back(op(0, "c/a"));
        assert!(queue.select_batch(0).is_empty());
        assert_eq!(queue.pending_len(), 1);
    }

    /// Draining a deep queue in small batches must stay linear. With a
    /// per-pass scan of the whole queue this takes minutes.
    #[test]
    fn test_large_queue_drains_in_linear_time() {
        let n = 200_000u64;
        let mut queue = OperationQueue::new();
        for i in 0..n {
            // Every tenth write hits a shared hot document.
            let doc = if i % 10 == 0 { "c/hot".to_string() } else { format!("c/{}", i) };
            queue.push_back(op(i, &doc));
        }

        let started = std::time::Instant::now();
        let mut drained = 0;
        let mut last_hot = None;
        while queue.pending_len() > 0 {
            let batch = queue.select_batch(20);
            assert!(!batch.is_empty());
            for op in &batch {
                if op.document().as_str() == "c/hot" {
                    assert!(last_hot.map_or(true, |prev| op.id > prev));
                    last_hot = Some(op.id);
                }
            }
            drained += batch.len() as u64;
            for op in &batch {
                queue.release(op.document());
            }
        }

        assert_eq!(drained, n);
        assert_eq!(queue.eligible_len(20), 0);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "draining took {:?}",
            started.elapsed()
        );
    }
}
