//! Retry classification.
//!
//! [`RetryPolicy`] decides which backend statuses are transient. The writer
//! re-enqueues a write that failed with a retryable status until it has used
//! up its attempt budget. [`ErrorDecision`] is what an error listener returns
//! after seeing a permanent failure.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::StatusCode;

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_CODES: [StatusCode; 3] = [
    StatusCode::Aborted,
    StatusCode::Unavailable,
    StatusCode::ResourceExhausted,
];

/// The retryability predicate: a set of status codes considered transient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Codes that cause an automatic retry.
    pub retryable_codes: BTreeSet<StatusCode>,
}

impl RetryPolicy {
    /// A policy retrying exactly `codes`.
    pub fn new(codes: impl IntoIterator<Item = StatusCode>) -> Self {
        Self {
            retryable_codes: codes.into_iter().collect(),
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            retryable_codes: BTreeSet::new(),
        }
    }

    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_codes.contains(&code)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_CODES)
    }
}

/// What an error listener wants done with a permanently failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorDecision {
    /// Let the failure stand.
    #[default]
    Accept,
    /// Try the write once more, if the attempt budget allows.
    RetryOnce,
}

impl ErrorDecision {
    /// Combines decisions from several listeners. Any `RetryOnce` wins.
    pub fn merge(self, other: ErrorDecision) -> ErrorDecision {
        if self == ErrorDecision::RetryOnce || other == ErrorDecision::RetryOnce {
            ErrorDecision::RetryOnce
        } else {
            ErrorDecision::Accept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(StatusCode::Aborted));
        assert!(policy.is_retryable(StatusCode::Unavailable));
        assert!(policy.is_retryable(StatusCode::ResourceExhausted));

        assert!(!policy.is_retryable(StatusCode::NotFound));
        assert!(!policy.is_retryable(StatusCode::InvalidArgument));
        assert!(!policy.is_retryable(StatusCode::FailedPrecondition));
    }

    #[test]
    fn test_policy_from_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"retryable_codes": ["INTERNAL", "ABORTED"]}"#).unwrap();
        assert!(policy.is_retryable(StatusCode::Internal));
        assert!(!policy.is_retryable(StatusCode::Unavailable));
    }

    #[test]
    fn test_decision_merge() {
        use ErrorDecision::*;
        assert_eq!(Accept.merge(Accept), Accept);
        assert_eq!(Accept.merge(RetryOnce), RetryOnce);
        assert_eq!(RetryOnce.merge(Accept), RetryOnce);
    }
}
