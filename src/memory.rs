//! # In-Memory Backend
//!
//! A deterministic document store implementing both collaborator traits, for
//! tests and for the `bulk_load` driver.
//!
//! Besides applying writes, it can be scripted to fail:
//!
//! | Method | Effect |
//! |--------|--------|
//! | [`fail_next`](InMemoryBackend::fail_next) | next write to a document returns a status |
//! | [`fail_always`](InMemoryBackend::fail_always) | every write to a document returns a status |
//! | [`fail_next_batch`](InMemoryBackend::fail_next_batch) | next submit call fails as a whole |
//! | [`truncate_next_response`](InMemoryBackend::truncate_next_response) | next response is one result short |
//! | [`fail_stream_after`](InMemoryBackend::fail_stream_after) | next page stream errors after `n` documents |
//! | [`with_fault_injection`](InMemoryBackend::with_fault_injection) | seeded random per-write failures |
//!
//! and it records what it saw: every batch, attempts per document, every
//! page request, and whether two concurrent batches ever touched the same
//! document.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::transport::{BatchResponse, BatchSubmitter, DeleteTarget, DescendantQuery};
use crate::types::{
    DocumentRef, Precondition, Status, StatusCode, Timestamp, Write, WriteKind,
};

/// One recorded `stream_page` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCall {
    pub limit: usize,
    pub start_after: Option<DocumentRef>,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    data: Vec<u8>,
    update_time: Timestamp,
}

struct FaultInjector {
    rng: StdRng,
    rate: f64,
    code: StatusCode,
}

#[derive(Default)]
struct State {
    documents: BTreeMap<DocumentRef, StoredDocument>,
    commit_seq: i64,

    scripted: HashMap<DocumentRef, VecDeque<Status>>,
    always: HashMap<DocumentRef, Status>,
    batch_failures: VecDeque<Status>,
    truncate_responses: usize,
    stream_failures: VecDeque<(usize, Status)>,
    faults: Option<FaultInjector>,

    batches: Vec<Vec<Write>>,
    attempts: HashMap<DocumentRef, usize>,
    stream_calls: Vec<StreamCall>,
    in_flight: HashSet<DocumentRef>,
    overlaps: usize,
}

/// Deterministic in-memory document store.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every submit call take `latency` before it answers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails each write with `code` with probability `rate`, using a seeded RNG.
    pub fn with_fault_injection(self, seed: u64, rate: f64, code: StatusCode) -> Self {
        self.lock().faults = Some(FaultInjector {
            rng: StdRng::seed_from_u64(seed),
            rate: rate.clamp(0.0, 1.0),
            code,
        });
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    /// Stores a document directly, bypassing the write path.
    pub fn insert(&self, document: impl Into<DocumentRef>, data: Vec<u8>) {
        let mut state = self.lock();
        state.commit_seq += 1;
        let update_time = Timestamp::new(state.commit_seq, 0);
        state
            .documents
            .insert(document.into(), StoredDocument { data, update_time });
    }

    pub fn document(&self, document: impl Into<DocumentRef>) -> Option<Vec<u8>> {
        self.lock()
            .documents
            .get(&document.into())
            .map(|d| d.data.clone())
    }

    pub fn update_time(&self, document: impl Into<DocumentRef>) -> Option<Timestamp> {
        self.lock()
            .documents
            .get(&document.into())
            .map(|d| d.update_time)
    }

    pub fn contains(&self, document: impl Into<DocumentRef>) -> bool {
        self.lock().documents.contains_key(&document.into())
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// The next write to `document` fails with `status`. Calls queue up.
    pub fn fail_next(&self, document: impl Into<DocumentRef>, status: Status) {
        self.lock()
            .scripted
            .entry(document.into())
            .or_default()
            .push_back(status);
    }

    /// Every write to `document` fails with `status`.
    pub fn fail_always(&self, document: impl Into<DocumentRef>, status: Status) {
        self.lock().always.insert(document.into(), status);
    }

    /// The next submit call fails as a whole with `status`. Calls queue up.
    pub fn fail_next_batch(&self, status: Status) {
        self.lock().batch_failures.push_back(status);
    }

    /// The next submit call returns one result fewer than it was sent.
    pub fn truncate_next_response(&self) {
        self.lock().truncate_responses += 1;
    }

    /// The next page stream yields at most `after` documents, then `status`.
    pub fn fail_stream_after(&self, after: usize, status: Status) {
        self.lock().stream_failures.push_back((after, status));
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Every batch received, in arrival order.
    pub fn batches(&self) -> Vec<Vec<Write>> {
        self.lock().batches.clone()
    }

    pub fn batch_count(&self) -> usize {
        self.lock().batches.len()
    }

    /// How many times a write to `document` was received.
    pub fn attempts(&self, document: impl Into<DocumentRef>) -> usize {
        self.lock()
            .attempts
            .get(&document.into())
            .copied()
            .unwrap_or(0)
    }

    pub fn stream_calls(&self) -> Vec<StreamCall> {
        self.lock().stream_calls.clone()
    }

    /// Writes that arrived while another batch for the same document was
    /// still being processed. Always zero for a correct writer.
    pub fn overlapping_writes(&self) -> usize {
        self.lock().overlaps
    }
}

impl State {
    fn apply(&mut self, write: &Write, commit_time: Timestamp) -> Result<Timestamp, Status> {
        if let Some(status) = self
            .scripted
            .get_mut(&write.document)
            .and_then(VecDeque::pop_front)
        {
            return Err(status);
        }
        if let Some(status) = self.always.get(&write.document) {
            return Err(status.clone());
        }
        if let Some(faults) = self.faults.as_mut() {
            if faults.rng.gen_bool(faults.rate) {
                return Err(Status::new(faults.code, "injected fault"));
            }
        }

        let existing = self.documents.get(&write.document);
        match write.precondition {
            Some(Precondition::Exists(true)) if existing.is_none() => {
                let message = match write.kind {
                    WriteKind::Update => format!("no document to update: {}", write.document),
                    _ => format!("document not found: {}", write.document),
                };
                return Err(Status::new(StatusCode::NotFound, message));
            }
            Some(Precondition::Exists(false)) if existing.is_some() => {
                return Err(Status::new(
                    StatusCode::AlreadyExists,
                    format!("document already exists: {}", write.document),
                ));
            }
            Some(Precondition::UpdateTime(expected))
                if existing.map(|d| d.update_time) != Some(expected) =>
            {
                return Err(Status::new(
                    StatusCode::FailedPrecondition,
                    format!("update time mismatch for {}", write.document),
                ));
            }
            _ => {}
        }

        match write.kind {
            WriteKind::Delete => {
                self.documents.remove(&write.document);
            }
            WriteKind::Create | WriteKind::Set | WriteKind::Update => {
                self.documents.insert(
                    write.document.clone(),
                    StoredDocument {
                        data: write.data.clone(),
                        update_time: commit_time,
                    },
                );
            }
        }
        Ok(commit_time)
    }
}

#[async_trait]
impl BatchSubmitter for InMemoryBackend {
    async fn submit(&self, writes: Vec<Write>) -> Result<BatchResponse, Status> {
        let batch_failure = {
            let mut state = self.lock();
            state.batches.push(writes.clone());
            for write in &writes {
                *state.attempts.entry(write.document.clone()).or_default() += 1;
                if !state.in_flight.insert(write.document.clone()) {
                    state.overlaps += 1;
                }
            }
            state.batch_failures.pop_front()
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        for write in &writes {
            state.in_flight.remove(&write.document);
        }
        if let Some(status) = batch_failure {
            return Err(status);
        }

        state.commit_seq += 1;
        let commit_time = Timestamp::new(state.commit_seq, 0);
        let mut results: BatchResponse = writes
            .iter()
            .map(|write| state.apply(write, commit_time))
            .collect();

        if state.truncate_responses > 0 {
            state.truncate_responses -= 1;
            results.pop();
        }
        Ok(results)
    }
}

impl DescendantQuery for InMemoryBackend {
    fn stream_page(
        &self,
        target: &DeleteTarget,
        limit: usize,
        start_after: Option<&DocumentRef>,
    ) -> BoxStream<'static, Result<DocumentRef, Status>> {
        let mut state = self.lock();
        state.stream_calls.push(StreamCall {
            limit,
            start_after: start_after.cloned(),
        });

        let page: Vec<DocumentRef> = state
            .documents
            .keys()
            .filter(|doc| target.contains(doc))
            .filter(|doc| start_after.map_or(true, |cursor| *doc > cursor))
            .take(limit)
            .cloned()
            .collect();

        match state.stream_failures.pop_front() {
            Some((after, status)) => stream::iter(page.into_iter().take(after).map(Ok))
                .chain(stream::once(async move { Err(status) }))
                .boxed(),
            None => stream::iter(page.into_iter().map(Ok)).boxed(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
