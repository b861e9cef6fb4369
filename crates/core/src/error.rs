//! Error types for kvdex
//!
//! `KvdexError` is the unified error type for every engine API. The
//! propagation policy is split in two:
//!
//! - Outcomes the engine can express as a clean commit result (an atomic
//!   that lost its optimistic check, an index collision) are **returned**
//!   as `CommitResult`/`WriteResult` values and never surface here.
//! - Programmer errors (invalid collection configuration), corrupted
//!   storage, and serialization failures are **errors** of this type.
//!
//! Callback failures collected by list traversals are batched into a
//! single `AggregateOperation` error raised after the traversal finishes,
//! so one bad document cannot silently swallow the rest of the walk.

use thiserror::Error;

/// Result type alias for kvdex operations.
pub type KvdexResult<T> = std::result::Result<T, KvdexError>;

/// Unified error type for all kvdex operations.
#[derive(Debug, Error)]
pub enum KvdexError {
    /// The operation requires a capability the collection does not declare
    /// (atomic access to an encoded collection, `sum` on a non-u64
    /// document, a reserved key part in a collection path).
    #[error("invalid collection: {reason}")]
    InvalidCollection {
        /// Why the collection cannot serve the operation.
        reason: String,
    },

    /// Stored bytes could not be reassembled into a document: a segment is
    /// missing, undecodable, or an entry's id disagrees with its key.
    #[error("corrupted document: {reason}")]
    CorruptedDocument {
        /// What the reassembly found.
        reason: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong.
        message: String,
    },

    /// Low-level storage failure reported by the KV primitive.
    #[error("storage error: {message}")]
    Storage {
        /// Error message from the backend.
        message: String,
    },

    /// Invalid input to an engine API.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the bad input.
        message: String,
    },

    /// One or more user callbacks failed during a list traversal. Raised
    /// after the traversal completes, carrying every failure.
    #[error("{} operation callback(s) failed", .errors.len())]
    AggregateOperation {
        /// The collected failures, in completion order.
        errors: Vec<KvdexError>,
    },
}

impl KvdexError {
    /// Create an `InvalidCollection` error.
    pub fn invalid_collection(reason: impl Into<String>) -> Self {
        KvdexError::InvalidCollection {
            reason: reason.into(),
        }
    }

    /// Create a `CorruptedDocument` error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        KvdexError::CorruptedDocument {
            reason: reason.into(),
        }
    }

    /// Create a `Serialization` error.
    pub fn serialization(message: impl Into<String>) -> Self {
        KvdexError::Serialization {
            message: message.into(),
        }
    }

    /// Create a `Storage` error.
    pub fn storage(message: impl Into<String>) -> Self {
        KvdexError::Storage {
            message: message.into(),
        }
    }

    /// Create an `InvalidInput` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        KvdexError::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an `AggregateOperation` error from collected failures.
    pub fn aggregate(errors: Vec<KvdexError>) -> Self {
        KvdexError::AggregateOperation { errors }
    }

    /// True for corrupted-storage errors.
    pub fn is_corruption(&self) -> bool {
        matches!(self, KvdexError::CorruptedDocument { .. })
    }

    /// True for collection-capability errors.
    pub fn is_invalid_collection(&self) -> bool {
        matches!(self, KvdexError::InvalidCollection { .. })
    }

    /// True for batched callback failures.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, KvdexError::AggregateOperation { .. })
    }
}

impl From<serde_json::Error> for KvdexError {
    fn from(e: serde_json::Error) -> Self {
        KvdexError::Serialization {
            message: e.to_string(),
        }
    }
}

// The serde bridge reports through the unified type directly.
impl serde::ser::Error for KvdexError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        KvdexError::serialization(msg.to_string())
    }
}

impl serde::de::Error for KvdexError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        KvdexError::serialization(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_collection() {
        let e = KvdexError::invalid_collection("atomic on encoded collection");
        assert!(e.to_string().contains("invalid collection"));
        assert!(e.to_string().contains("encoded"));
    }

    #[test]
    fn test_display_aggregate_counts_failures() {
        let e = KvdexError::aggregate(vec![
            KvdexError::storage("a"),
            KvdexError::storage("b"),
        ]);
        assert!(e.to_string().contains("2 operation callback(s) failed"));
    }

    #[test]
    fn test_predicates() {
        assert!(KvdexError::corrupted("bad segment").is_corruption());
        assert!(KvdexError::invalid_collection("x").is_invalid_collection());
        assert!(KvdexError::aggregate(vec![]).is_aggregate());
        assert!(!KvdexError::storage("x").is_corruption());
    }

    #[test]
    fn test_from_serde_json() {
        let bad: Result<i32, _> = serde_json::from_str("not json");
        let e: KvdexError = bad.unwrap_err().into();
        assert!(matches!(e, KvdexError::Serialization { .. }));
    }
}
