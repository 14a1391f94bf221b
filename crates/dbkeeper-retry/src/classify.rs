//! Transient-error classification.
//!
//! Classification is a case-insensitive substring match of the error's
//! display text against a table of signatures. Anything that matches no
//! signature is fatal.

use std::borrow::Cow;
use std::fmt;

/// Signatures of failures that are expected to succeed when retried.
///
/// All entries are lowercase.
pub const DEFAULT_SIGNATURES: &[&str] = &[
    // connection refused / timeout / lost / terminated / reset
    "connection refused",
    "econnrefused",
    "connection timeout",
    "connection timed out",
    "connection lost",
    "connection terminated",
    "connection reset",
    "econnreset",
    // capacity
    "pool exhausted",
    "too many connections",
    "connection limit exceeded",
    "remaining connection slots are reserved",
    // server side hang-ups
    "server closed the connection",
    "server has closed the connection",
    "socket hang up",
    "broken pipe",
    // name resolution / routing
    "enotfound",
    "eai_again",
    "getaddrinfo",
    "enetunreach",
    "network is unreachable",
    "ehostunreach",
    // generic timeouts
    "etimedout",
    "timeout",
    "timed out",
];

/// Table-driven predicate deciding whether an error is transient.
///
/// # Example
///
/// ```rust
/// use dbkeeper_retry::ErrorClassifier;
///
/// let classifier = ErrorClassifier::default().with_signature("deadlock victim");
/// assert!(classifier.is_retryable(&"Transaction was chosen as deadlock victim"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    signatures: Vec<Cow<'static, str>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            signatures: DEFAULT_SIGNATURES.iter().copied().map(Cow::Borrowed).collect(),
        }
    }
}

impl ErrorClassifier {
    /// A classifier with no signatures; every error is fatal.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Add a signature to the table.
    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<Cow<'static, str>>) -> Self {
        self.push_signature(signature);
        self
    }

    /// Add a signature to the table in place.
    pub fn push_signature(&mut self, signature: impl Into<Cow<'static, str>>) {
        let signature = signature.into();
        let lowered = signature.to_lowercase();
        if lowered.is_empty() || self.signatures.iter().any(|s| *s == lowered) {
            return;
        }
        self.signatures.push(Cow::Owned(lowered));
    }

    /// The current signature table.
    pub fn signatures(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(AsRef::as_ref)
    }

    /// Returns the first signature matching `message`, if any.
    #[must_use]
    pub fn matching_signature(&self, message: &str) -> Option<&str> {
        let message = message.to_lowercase();
        self.signatures
            .iter()
            .map(AsRef::as_ref)
            .find(|signature| message.contains(signature))
    }

    /// Whether `error` is transient according to this table.
    #[must_use]
    pub fn is_retryable<E: fmt::Display + ?Sized>(&self, error: &E) -> bool {
        self.matching_signature(&error.to_string()).is_some()
    }
}

/// Classify `error` with the default signature table.
#[must_use]
pub fn is_retryable<E: fmt::Display + ?Sized>(error: &E) -> bool {
    ErrorClassifier::default().is_retryable(error)
}
