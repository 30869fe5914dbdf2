//! # Success and Error Listeners
//!
//! Callers can observe every write's outcome without holding its
//! [`WriteHandle`](crate::writer::WriteHandle), by registering listeners on the
//! writer:
//!
//! - A **success listener** sees `(document, result)` for every write that
//!   succeeds. It runs before the write's handle resolves.
//! - An **error listener** sees every [`BulkWriteError`] once the write has
//!   failed permanently, and may answer [`ErrorDecision::RetryOnce`].
//!
//! ## Executors
//!
//! Listeners are user code and may block, so they never run on the dispatch
//! actor. Each listener is bound to a Tokio runtime [`Handle`] and invoked with
//! `spawn_blocking` on that runtime. A listener registered without an explicit
//! handle uses the runtime the writer was created on.
//!
//! ## Panics
//!
//! A panicking listener does not take anything else down. The panic is caught
//! by the blocking task, turned into [`Error::ListenerPanicked`], and becomes
//! the result of the write it was called for.

use std::any::Any;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use crate::error::{BulkWriteError, Error, Result};
use crate::retry::ErrorDecision;
use crate::types::{DocumentRef, WriteResult};

/// Callback for successful writes.
pub type SuccessCallback = Arc<dyn Fn(&DocumentRef, &WriteResult) + Send + Sync>;

/// Callback for permanently failed writes.
pub type ErrorCallback = Arc<dyn Fn(&BulkWriteError) -> ErrorDecision + Send + Sync>;

#[derive(Clone)]
pub(crate) struct SuccessListener {
    pub executor: Handle,
    pub callback: SuccessCallback,
}

#[derive(Clone)]
pub(crate) struct ErrorListener {
    pub executor: Handle,
    pub callback: ErrorCallback,
}

impl SuccessListener {
    pub fn new<F>(executor: Handle, callback: F) -> Self
    where
        F: Fn(&DocumentRef, &WriteResult) + Send + Sync + 'static,
    {
        Self {
            executor,
            callback: Arc::new(callback),
        }
    }
}

impl ErrorListener {
    pub fn new<F>(executor: Handle, callback: F) -> Self
    where
        F: Fn(&BulkWriteError) -> ErrorDecision + Send + Sync + 'static,
    {
        Self {
            executor,
            callback: Arc::new(callback),
        }
    }
}

/// Registered listeners, in registration order.
///
/// # Rust Pattern: Copy-on-Write Snapshots
///
/// The lists live behind `Arc`s. Each notification task takes a cheap clone of
/// the current list, and registering a listener uses `Arc::make_mut`, which
/// only copies the list if a notification still holds the old one.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    success: Arc<Vec<SuccessListener>>,
    error: Arc<Vec<ErrorListener>>,
}

impl Listeners {
    pub fn add_success(&mut self, listener: SuccessListener) {
        Arc::make_mut(&mut self.success).push(listener);
    }

    pub fn add_error(&mut self, listener: ErrorListener) {
        Arc::make_mut(&mut self.error).push(listener);
    }

    pub fn success_snapshot(&self) -> Option<Arc<Vec<SuccessListener>>> {
        (!self.success.is_empty()).then(|| Arc::clone(&self.success))
    }

    pub fn error_snapshot(&self) -> Option<Arc<Vec<ErrorListener>>> {
        (!self.error.is_empty()).then(|| Arc::clone(&self.error))
    }
}

/// Runs every success listener, one after another.
///
/// All listeners run even if one panics; the first panic is returned.
pub(crate) async fn notify_success(
    listeners: &[SuccessListener],
    document: &DocumentRef,
    result: WriteResult,
) -> Result<()> {
    let mut outcome = Ok(());
    for listener in listeners {
        let callback = Arc::clone(&listener.callback);
        let doc = document.clone();
        let joined = listener
            .executor
            .spawn_blocking(move || callback(&doc, &result))
            .await;

        if let Err(e) = joined {
            let err = join_error(e);
            warn!(document = %document, error = %err, "success listener failed");
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }
    outcome
}

/// Runs every error listener and merges their decisions.
///
/// Any `RetryOnce` wins. If a listener panics the remaining listeners still
/// run, and the first panic is returned instead of a decision.
pub(crate) async fn notify_error(
    listeners: &[ErrorListener],
    error: &BulkWriteError,
) -> Result<ErrorDecision> {
    let mut decision = ErrorDecision::Accept;
    let mut panicked = None;
    for listener in listeners {
        let callback = Arc::clone(&listener.callback);
        let failure = error.clone();
        let joined = listener
            .executor
            .spawn_blocking(move || callback(&failure))
            .await;

        match joined {
            Ok(d) => decision = decision.merge(d),
            Err(e) => {
                let err = join_error(e);
                warn!(document = %error.document, error = %err, "error listener failed");
                panicked.get_or_insert(err);
            }
        }
    }
    match panicked {
        Some(err) => Err(err),
        None => Ok(decision),
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    if e.is_panic() {
        Error::ListenerPanicked {
            message: panic_message(e.into_panic()),
        }
    } else {
        Error::ListenerPanicked {
            message: "listener task was cancelled".to_string(),
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
