#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bulkwriter::{
    BulkWriter, DocumentRef, InMemoryBackend, Status, StatusCode, ThrottleConfig, VirtualClock,
    Write, WriteHandle, WriterConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bulkwriter=debug")
        .with_test_writer()
        .try_init();
}

pub fn backend() -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::new())
}

/// Writer on a virtual clock, so rate-limit waits complete instantly.
pub fn virtual_writer(
    backend: &Arc<InMemoryBackend>,
    config: WriterConfig,
) -> (BulkWriter, VirtualClock) {
    let clock = VirtualClock::new(0);
    let writer = BulkWriter::with_clock(backend.clone(), config, Arc::new(clock.clone()))
        .expect("start writer");
    (writer, clock)
}

pub fn unthrottled(max_batch_size: usize) -> WriterConfig {
    WriterConfig {
        max_batch_size,
        throttle: ThrottleConfig::disabled(),
        ..WriterConfig::default()
    }
}

pub fn doc(collection: &str, i: usize) -> DocumentRef {
    DocumentRef::new(format!("{}/doc-{:04}", collection, i))
}

/// Enqueues `set` writes for `n` distinct documents in one collection.
pub fn set_many(writer: &BulkWriter, collection: &str, n: usize) -> Vec<WriteHandle> {
    (0..n)
        .map(|i| {
            writer
                .set(doc(collection, i), format!("v{}", i).into_bytes())
                .expect("enqueue")
        })
        .collect()
}

pub async fn await_all(handles: Vec<WriteHandle>) -> Vec<bulkwriter::Result<bulkwriter::WriteResult>> {
    futures::future::join_all(handles).await
}

pub fn unavailable() -> Status {
    Status::new(StatusCode::Unavailable, "backend unavailable")
}

pub fn batch_sizes(batches: &[Vec<Write>]) -> Vec<usize> {
    batches.iter().map(Vec::len).collect()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
