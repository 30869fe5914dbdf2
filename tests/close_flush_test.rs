//! Flush and Close Tests
//!
//! Tests the draining guarantees:
//! - A flush resolves only after every earlier write has resolved
//! - A flush does not wait for writes enqueued after it
//! - Close drains like flush and then rejects new work
//! - Dropping the writer still completes outstanding writes

mod common;

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use bulkwriter::{BulkWriter, ErrorDecision, Error, InMemoryBackend};
use futures::FutureExt;

#[tokio::test]
async fn flush_waits_for_earlier_writes() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(20)));
    let writer = BulkWriter::new(backend.clone(), common::unthrottled(5)).unwrap();

    let handles = common::set_many(&writer, "users", 12);
    writer.flush().unwrap().await.unwrap();

    for handle in handles {
        let result = handle.now_or_never().expect("write resolved before flush");
        result.unwrap();
    }
    assert_eq!(backend.len(), 12);
}

#[tokio::test]
async fn flush_waits_for_retries() {
    let backend = common::backend();
    let (writer, _clock) = common::virtual_writer(&backend, common::unthrottled(20));
    backend.fail_next("c/a", common::unavailable());
    backend.fail_next("c/a", common::unavailable());

    let handle = writer.set("c/a", Vec::new()).unwrap();
    writer.flush().unwrap().await.unwrap();

    assert!(handle.now_or_never().expect("resolved").is_ok());
    assert_eq!(backend.attempts("c/a"), 3);
}

/// The later write is held inside a blocking error listener until the test
/// releases it, so the flush must resolve while it is still outstanding.
#[tokio::test]
async fn flush_ignores_later_writes() {
    let backend = common::backend();
    let (writer, _clock) = common::virtual_writer(&backend, common::unthrottled(20));

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    writer
        .add_error_listener(move |_| {
            let _ = release_rx.lock().unwrap().recv();
            ErrorDecision::Accept
        })
        .unwrap();

    let earlier = writer.set("c/a", Vec::new()).unwrap();
    let flushed = writer.flush().unwrap();
    let later = writer.update("c/missing", Vec::new()).unwrap();

    flushed.await.unwrap();
    assert!(earlier.now_or_never().is_some());

    release_tx.send(()).unwrap();
    assert!(later.await.is_err());
}

#[tokio::test]
async fn flush_on_idle_writer_resolves_immediately() {
    let backend = common::backend();
    let (writer, _clock) = common::virtual_writer(&backend, common::unthrottled(20));

    writer.flush().unwrap().await.unwrap();
    writer.flush().unwrap().await.unwrap();
    assert_eq!(backend.batch_count(), 0);
}

#[tokio::test]
async fn consecutive_flushes_resolve_in_order() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(10)));
    let writer = BulkWriter::new(backend.clone(), common::unthrottled(20)).unwrap();

    let _first = writer.set("c/a", Vec::new()).unwrap();
    let mut flush_a = writer.flush().unwrap();
    let _second = writer.set("c/b", Vec::new()).unwrap();
    let flush_b = writer.flush().unwrap();

    flush_b.await.unwrap();
    assert!((&mut flush_a).now_or_never().is_some());
}

#[tokio::test]
async fn close_drains_and_rejects_new_work() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(10)));
    let writer = BulkWriter::new(backend.clone(), common::unthrottled(20)).unwrap();

    let handles = common::set_many(&writer, "users", 30);
    let closed = writer.close().unwrap();
    assert!(writer.is_closed());
    assert_eq!(writer.set("users/late", Vec::new()).unwrap_err(), Error::Closed);

    closed.await.unwrap();
    for handle in handles {
        assert!(handle.now_or_never().expect("resolved before close").is_ok());
    }
    assert_eq!(backend.len(), 30);

    assert_eq!(writer.close().unwrap_err(), Error::Closed);
    assert_eq!(writer.flush().unwrap_err(), Error::Closed);
    assert_eq!(writer.set_max_batch_size(3).unwrap_err(), Error::Closed);
}

#[tokio::test]
async fn close_is_seen_by_clones() {
    let backend = common::backend();
    let (writer, _clock) = common::virtual_writer(&backend, common::unthrottled(20));
    let clone = writer.clone();

    writer.close().unwrap().await.unwrap();
    assert!(clone.is_closed());
    assert_eq!(clone.delete("c/a").unwrap_err(), Error::Closed);
}

#[tokio::test]
async fn dropping_writer_completes_outstanding_writes() {
    let backend = Arc::new(InMemoryBackend::new().with_latency(Duration::from_millis(5)));
    let writer = BulkWriter::new(backend.clone(), common::unthrottled(3)).unwrap();

    let handles = common::set_many(&writer, "users", 10);
    drop(writer);

    for result in common::await_all(handles).await {
        result.unwrap();
    }
    assert_eq!(backend.len(), 10);
}

/// Writers racing a close on another clone either land before the close or
/// fail through their own handle. None are left hanging.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enqueue_racing_close_resolves_every_handle() {
    let backend = common::backend();
    let writer = BulkWriter::new(backend.clone(), common::unthrottled(10)).unwrap();

    let mut producers = Vec::new();
    for p in 0..4 {
        let writer = writer.clone();
        producers.push(tokio::spawn(async move {
            let mut handles = Vec::new();
            for i in 0..500 {
                match writer.set(common::doc(&format!("p{}", p), i), Vec::new()) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        assert_eq!(e, Error::Closed);
                        break;
                    }
                }
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            handles
        }));
    }

    tokio::task::yield_now().await;
    let closed = writer.close().unwrap();

    let mut handles = Vec::new();
    for producer in producers {
        handles.extend(producer.await.unwrap());
    }
    tokio::time::timeout(Duration::from_secs(10), closed)
        .await
        .expect("close hung")
        .unwrap();

    let results = tokio::time::timeout(Duration::from_secs(10), common::await_all(handles))
        .await
        .expect("a racing write never resolved");
    let mut committed = 0;
    for result in results {
        match result {
            Ok(_) => committed += 1,
            Err(e) => assert_eq!(e, Error::Closed),
        }
    }
    assert_eq!(backend.len(), committed);
}
