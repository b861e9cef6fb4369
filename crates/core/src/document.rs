//! Documents, versionstamps, and commit results

use crate::key::KeyPart;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque monotonic token minted by the KV primitive on every write.
///
/// Rendered as a fixed-width 20-digit lowercase hex string so
/// lexicographic comparison equals numeric comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Versionstamp(String);

impl Versionstamp {
    /// Render a counter value as a versionstamp.
    pub fn from_counter(counter: u64) -> Self {
        Versionstamp(format!("{:020x}", counter))
    }

    /// The token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Versionstamp {
    fn from(s: String) -> Self {
        Versionstamp(s)
    }
}

/// A read result: the document id, the versionstamp of its last write,
/// and the parsed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Document<T> {
    /// Primary id, the final part of the document's id key.
    pub id: KeyPart,
    /// Versionstamp of the write that produced this value.
    pub versionstamp: Versionstamp,
    /// The parsed document value.
    pub value: T,
}

impl<T> Document<T> {
    /// Map the value, keeping id and versionstamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Document<U> {
        Document {
            id: self.id,
            versionstamp: self.versionstamp,
            value: f(self.value),
        }
    }
}

/// Outcome of an atomic commit.
///
/// A lost optimistic check is a normal outcome, not an error, so it is
/// expressed in the type rather than thrown.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    /// All contained operations applied.
    Committed {
        /// Versionstamp assigned to the commit.
        versionstamp: Versionstamp,
    },
    /// A check failed or a collision gate rejected the commit. Nothing
    /// applied.
    Conflict,
}

impl CommitResult {
    /// True when the commit applied.
    pub fn is_ok(&self) -> bool {
        matches!(self, CommitResult::Committed { .. })
    }

    /// The commit's versionstamp, when it applied.
    pub fn versionstamp(&self) -> Option<&Versionstamp> {
        match self {
            CommitResult::Committed { versionstamp } => Some(versionstamp),
            CommitResult::Conflict => None,
        }
    }
}

/// Outcome of a document write (`add`/`set`/`write`/`update`).
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    /// The document committed under `id`.
    Committed {
        /// Id of the written document.
        id: KeyPart,
        /// Versionstamp assigned to the commit.
        versionstamp: Versionstamp,
    },
    /// An id or index collision (or exhausted retries) prevented the
    /// write. Nothing applied.
    Conflict,
}

impl WriteResult {
    /// True when the write applied.
    pub fn is_ok(&self) -> bool {
        matches!(self, WriteResult::Committed { .. })
    }

    /// The written document's id, when the write applied.
    pub fn id(&self) -> Option<&KeyPart> {
        match self {
            WriteResult::Committed { id, .. } => Some(id),
            WriteResult::Conflict => None,
        }
    }

    /// The commit's versionstamp, when the write applied.
    pub fn versionstamp(&self) -> Option<&Versionstamp> {
        match self {
            WriteResult::Committed { versionstamp, .. } => Some(versionstamp),
            WriteResult::Conflict => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versionstamp_is_fixed_width_hex() {
        let vs = Versionstamp::from_counter(255);
        assert_eq!(vs.as_str().len(), 20);
        assert!(vs.as_str().ends_with("ff"));
    }

    #[test]
    fn test_versionstamp_order_matches_counter_order() {
        let a = Versionstamp::from_counter(9);
        let b = Versionstamp::from_counter(10);
        let c = Versionstamp::from_counter(0xffff);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_document_map_keeps_metadata() {
        let doc = Document {
            id: KeyPart::String("d1".into()),
            versionstamp: Versionstamp::from_counter(1),
            value: 41,
        };
        let mapped = doc.map(|v| v + 1);
        assert_eq!(mapped.value, 42);
        assert_eq!(mapped.id, KeyPart::String("d1".into()));
    }

    #[test]
    fn test_commit_result_accessors() {
        let ok = CommitResult::Committed {
            versionstamp: Versionstamp::from_counter(3),
        };
        assert!(ok.is_ok());
        assert!(ok.versionstamp().is_some());
        assert!(!CommitResult::Conflict.is_ok());
        assert!(CommitResult::Conflict.versionstamp().is_none());
    }

    #[test]
    fn test_write_result_accessors() {
        let ok = WriteResult::Committed {
            id: KeyPart::String("x".into()),
            versionstamp: Versionstamp::from_counter(1),
        };
        assert_eq!(ok.id(), Some(&KeyPart::String("x".into())));
        assert!(WriteResult::Conflict.id().is_none());
    }
}
