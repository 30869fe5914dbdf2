//! # Domain Types for the Bulk Writer
//!
//! This module defines the core types used throughout the crate: document and
//! collection references, write descriptions, write results and status codes.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! We use the "newtype pattern" for identifiers - wrapping `String` in
//! single-field structs. This provides:
//!
//! - **Type safety**: Can't pass a [`CollectionRef`] where a [`DocumentRef`] is expected
//! - **Self-documenting code**: Function signatures tell you what they expect
//! - **Encapsulation**: Can add validation or change representation later
//!
//! ## Opaque Payloads
//!
//! Field encoding is not this crate's concern. A [`Write`] carries its fields as
//! already-encoded bytes, and the [`BatchSubmitter`](crate::transport::BatchSubmitter)
//! that talks to the backend is the only thing that ever looks inside.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Document Identification
// =============================================================================

/// A slash-separated path to a single document, e.g. `"users/alice"`.
///
/// Two writes conflict (and are never sent in the same batch) exactly when
/// their `DocumentRef`s are equal.
///
/// # Example
///
/// ```rust
/// use bulkwriter::types::DocumentRef;
///
/// let doc = DocumentRef::new("users/alice");
/// assert_eq!(doc.id(), "alice");
/// assert_eq!(doc.parent().as_str(), "users");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentRef(String);

impl DocumentRef {
    /// Creates a new document reference from a path.
    ///
    /// # Rust Pattern: impl Into<String>
    ///
    /// Accepting `impl Into<String>` lets callers pass either `&str` or an owned
    /// `String` without an explicit conversion.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the full path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the last path segment.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns the collection containing this document.
    pub fn parent(&self) -> CollectionRef {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionRef::new(parent),
            None => CollectionRef::new(""),
        }
    }

    /// Returns a subcollection of this document.
    pub fn collection(&self, id: &str) -> CollectionRef {
        CollectionRef::new(format!("{}/{}", self.0, id))
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocumentRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A slash-separated path to a collection, e.g. `"users"` or `"users/alice/posts"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionRef(String);

impl CollectionRef {
    /// Creates a new collection reference from a path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the full path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a document inside this collection.
    pub fn doc(&self, id: &str) -> DocumentRef {
        DocumentRef::new(format!("{}/{}", self.0, id))
    }

    /// Returns true if `document` lives somewhere below this collection,
    /// including inside nested subcollections.
    pub fn contains(&self, document: &DocumentRef) -> bool {
        document
            .as_str()
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// A backend commit timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: i64,
    /// Sub-second nanoseconds, `0..1_000_000_000`.
    pub nanos: i32,
}

impl Timestamp {
    /// The zero timestamp. Deletes of missing documents report this.
    pub const ZERO: Timestamp = Timestamp {
        seconds: 0,
        nanos: 0,
    };

    /// Creates a timestamp from seconds and nanoseconds.
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    /// Creates a timestamp from milliseconds since the epoch.
    pub fn from_millis(ms: u64) -> Self {
        Self {
            seconds: (ms / 1000) as i64,
            nanos: ((ms % 1000) * 1_000_000) as i32,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

// =============================================================================
// Writes
// =============================================================================

/// The four kinds of write a bulk writer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Create a document; fails if it already exists.
    Create,
    /// Overwrite (or create) a document.
    Set,
    /// Update fields of an existing document.
    Update,
    /// Delete a document.
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteKind::Create => "create",
            WriteKind::Set => "set",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A condition the backend checks before applying a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precondition {
    /// The document must (or must not) exist.
    Exists(bool),
    /// The document must have been last updated at exactly this time.
    UpdateTime(Timestamp),
}

/// One write as handed to the backend.
///
/// `data` is the already-encoded field payload; it is empty for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    /// The target document.
    pub document: DocumentRef,
    /// What kind of write this is.
    pub kind: WriteKind,
    /// Encoded fields.
    pub data: Vec<u8>,
    /// Optional precondition.
    pub precondition: Option<Precondition>,
}

impl Write {
    /// Creates a write without a precondition.
    pub fn new(document: DocumentRef, kind: WriteKind, data: Vec<u8>) -> Self {
        Self {
            document,
            kind,
            data,
            precondition: None,
        }
    }

    /// Attaches a precondition.
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }
}

/// The result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// When the backend applied the write.
    pub write_time: Timestamp,
}

// =============================================================================
// Status Codes
// =============================================================================

/// Canonical RPC status codes.
///
/// The numeric values match the canonical gRPC code table so that transports
/// can convert with [`StatusCode::from_i32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Converts a wire value. Unrecognised values map to `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }

    /// Returns the canonical upper-case name, e.g. `"UNAVAILABLE"`.
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A status code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// The code.
    pub code: StatusCode,
    /// Details from the backend (or from this crate).
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for an `INTERNAL` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Shorthand for an `UNAVAILABLE` status.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// =============================================================================
// Tests
// =============================================================================
