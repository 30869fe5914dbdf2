//! # Backend Collaborators
//!
//! The writer and the recursive delete talk to the database through two
//! traits. Everything behind them (RPC stubs, encoding, deadlines, auth) is
//! the implementor's business.
//!
//! ```text
//!   BulkWriter ──submit(Vec<Write>)──────────────────────▶ BatchSubmitter
//!              ◀─Ok([Ok(ts) | Err(status), ...]) / Err(status)─
//!
//!   recursive_delete ──stream_page(target, limit, cursor)──▶ DescendantQuery
//!                    ◀── doc, doc, doc, ..., [Err(status)] ───
//! ```
//!
//! ## Rust Pattern: async_trait
//!
//! `submit` is an `async fn` in a trait that is used as `Arc<dyn BatchSubmitter>`.
//! The `async_trait` macro boxes the returned future so the trait stays object
//! safe. `stream_page` returns a `BoxStream` for the same reason.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::{CollectionRef, DocumentRef, Status, Timestamp, Write};

/// Per-write outcomes of one batch, in request order.
pub type BatchResponse = Vec<std::result::Result<Timestamp, Status>>;

/// Sends one batch of writes to the backend.
#[async_trait]
pub trait BatchSubmitter: Send + Sync + 'static {
    /// Applies `writes` and reports one outcome per write, in the same order.
    ///
    /// Returning `Err` means the call itself failed; the status is applied to
    /// every write in the batch. A response whose length differs from the
    /// request is treated the same way, with an `INTERNAL` status.
    async fn submit(&self, writes: Vec<Write>) -> std::result::Result<BatchResponse, Status>;
}

/// What a recursive delete removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    /// Every document below the collection, at any depth.
    Collection(CollectionRef),
    /// Every document below the document, at any depth, then the document.
    Document(DocumentRef),
}

impl DeleteTarget {
    /// Returns true if `document` is a strict descendant of the target.
    pub fn contains(&self, document: &DocumentRef) -> bool {
        match self {
            DeleteTarget::Collection(collection) => collection.contains(document),
            DeleteTarget::Document(root) => document
                .as_str()
                .strip_prefix(root.as_str())
                .is_some_and(|rest| rest.starts_with('/')),
        }
    }
}

impl std::fmt::Display for DeleteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteTarget::Collection(c) => write!(f, "collection '{}'", c),
            DeleteTarget::Document(d) => write!(f, "document '{}'", d),
        }
    }
}

/// Lists descendant documents one page at a time.
pub trait DescendantQuery: Send + Sync + 'static {
    /// Streams up to `limit` descendants of `target` in a stable order,
    /// starting strictly after `start_after` (or from the beginning).
    ///
    /// The stream may end early with an `Err`; calling again with the last
    /// document received as the cursor resumes it.
    fn stream_page(
        &self,
        target: &DeleteTarget,
        limit: usize,
        start_after: Option<&DocumentRef>,
    ) -> BoxStream<'static, std::result::Result<DocumentRef, Status>>;
}
