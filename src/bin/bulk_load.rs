//! BulkWriter Load Driver
//!
//! Pushes a configurable number of writes through a [`BulkWriter`] backed by
//! the in-memory store, optionally with latency and random transient faults,
//! then checks the results and reports the writer's counters.
//! Run with: `cargo run --bin bulk_load -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default run: 10000 documents, 20 per batch, throttled
//! cargo run --release --bin bulk_load
//!
//! # Slow backend with 5% transient failures
//! cargo run --release --bin bulk_load -- --latency-ms 20 --fault-rate 0.05
//!
//! # Unthrottled, then delete everything again
//! cargo run --release --bin bulk_load -- --no-throttle --delete
//! ```
//!
//! Set `RUST_LOG=bulkwriter=debug` to see per-batch logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bulkwriter::{
    BulkWriter, CollectionRef, DeleteTarget, InMemoryBackend, StatusCode, ThrottleConfig,
    WriterConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Load run configuration
struct Config {
    /// Number of documents to write
    num_docs: usize,
    /// Maximum writes per batch
    batch_size: usize,
    /// Simulated backend latency per batch
    latency_ms: u64,
    /// Probability that a single write fails with UNAVAILABLE
    fault_rate: f64,
    /// Seed for fault injection
    seed: u64,
    /// Whether the rate limiter is enabled
    throttle: bool,
    /// Delete the collection recursively after loading it
    delete: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_docs: 10_000,
            batch_size: 20,
            latency_ms: 0,
            fault_rate: 0.0,
            seed: 42,
            throttle: true,
            delete: false,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--docs" | "-n" => {
                i += 1;
                config.num_docs = value(&args, i, "--docs");
            }
            "--batch-size" | "-b" => {
                i += 1;
                config.batch_size = value(&args, i, "--batch-size");
            }
            "--latency-ms" | "-l" => {
                i += 1;
                config.latency_ms = value(&args, i, "--latency-ms");
            }
            "--fault-rate" | "-f" => {
                i += 1;
                config.fault_rate = value(&args, i, "--fault-rate");
            }
            "--seed" => {
                i += 1;
                config.seed = value(&args, i, "--seed");
            }
            "--no-throttle" => {
                config.throttle = false;
            }
            "--delete" => {
                config.delete = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"BulkWriter Load Driver

Usage: bulk_load [OPTIONS]

Options:
  -n, --docs <N>          Documents to write (default: 10000)
  -b, --batch-size <N>    Maximum writes per batch (default: 20)
  -l, --latency-ms <MS>   Backend latency per batch (default: 0)
  -f, --fault-rate <P>    Per-write UNAVAILABLE probability (default: 0.0)
  --seed <N>              Fault injection seed (default: 42)
  --no-throttle           Disable the rate limiter
  --delete                Recursively delete the collection afterwards
  -h, --help              Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    match args.get(i).map(|s| s.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("Invalid {} value", flag);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();

    println!("BulkWriter Load Run");
    println!("===================");
    println!("Documents:   {}", config.num_docs);
    println!("Batch size:  {}", config.batch_size);
    println!("Latency:     {}ms", config.latency_ms);
    println!("Fault rate:  {}", config.fault_rate);
    println!("Throttling:  {}", if config.throttle { "on" } else { "off" });
    println!();

    let mut backend = InMemoryBackend::new();
    if config.latency_ms > 0 {
        backend = backend.with_latency(Duration::from_millis(config.latency_ms));
    }
    if config.fault_rate > 0.0 {
        backend = backend.with_fault_injection(config.seed, config.fault_rate, StatusCode::Unavailable);
    }
    let backend = Arc::new(backend);

    let writer_config = WriterConfig {
        max_batch_size: config.batch_size,
        throttle: if config.throttle {
            ThrottleConfig::default()
        } else {
            ThrottleConfig::disabled()
        },
        ..WriterConfig::default()
    };
    let writer = match BulkWriter::new(backend.clone(), writer_config) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let collection = CollectionRef::new("load");
    let start = Instant::now();
    let mut handles = Vec::with_capacity(config.num_docs);
    for i in 0..config.num_docs {
        let doc = collection.doc(&format!("doc-{:08}", i));
        match writer.set(doc, format!("payload {}", i).into_bytes()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                eprintln!("Enqueue failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    info!(docs = config.num_docs, "all writes enqueued");

    let mut failures = 0usize;
    for handle in handles {
        if handle.await.is_err() {
            failures += 1;
        }
    }
    let elapsed = start.elapsed();
    let metrics = writer.metrics();

    println!("Results");
    println!("-------");
    println!("Succeeded:       {}", metrics.succeeded);
    println!("Failed:          {}", metrics.failed);
    println!("Retried:         {}", metrics.retried);
    println!("Batches sent:    {}", metrics.batches_sent);
    println!("Deferrals:       {}", metrics.deferrals);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.0} writes/sec",
        config.num_docs as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!();

    println!("Verifying invariants...");
    let stored = backend.len();
    if stored + failures != config.num_docs {
        eprintln!(
            "  Stored {} + failed {} != enqueued {} ✗",
            stored, failures, config.num_docs
        );
        std::process::exit(1);
    }
    println!("  Every write resolved exactly once ✓");
    if backend.overlapping_writes() != 0 {
        eprintln!(
            "  {} writes overlapped another batch for the same document ✗",
            backend.overlapping_writes()
        );
        std::process::exit(1);
    }
    println!("  No same-document overlap ✓");

    if config.delete {
        println!();
        println!("Deleting collection...");
        let start = Instant::now();
        let result = writer
            .recursive_delete(backend.as_ref(), DeleteTarget::Collection(collection))
            .await;
        match result {
            Ok(()) => println!("  Deleted in {:?}, {} left", start.elapsed(), backend.len()),
            Err(e) => println!("  Recursive delete finished with errors: {}", e),
        }
    }

    match writer.close() {
        Ok(done) => {
            if let Err(e) = done.await {
                eprintln!("Close failed: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Close failed: {}", e);
            std::process::exit(1);
        }
    }

    println!();
    println!("Load run PASSED ✓");
}
