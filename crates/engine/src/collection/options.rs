//! Collection configuration and per-operation options

use crate::encoder::Encoder;
use crate::ids::IdGenerator;
use kvdex_core::{Document, KeyPart, MergeStrategy};
use kvdex_kv::Consistency;
use std::sync::Arc;
use std::time::Duration;

/// Kind of a declared index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Unique: at most one document per indexed value.
    Primary,
    /// Non-unique: any number of documents per indexed value.
    Secondary,
}

/// One declared index over a document field.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Name of the indexed field.
    pub field: String,
    /// Unique or non-unique.
    pub kind: IndexKind,
}

impl IndexSpec {
    /// Declare a unique index.
    pub fn primary(field: impl Into<String>) -> Self {
        IndexSpec {
            field: field.into(),
            kind: IndexKind::Primary,
        }
    }

    /// Declare a non-unique index.
    pub fn secondary(field: impl Into<String>) -> Self {
        IndexSpec {
            field: field.into(),
            kind: IndexKind::Secondary,
        }
    }
}

/// Collection-level configuration, fixed at construction.
#[derive(Clone, Default)]
pub struct CollectionOptions {
    /// Declared indices. Non-empty makes the collection indexable, which
    /// requires object document values.
    pub indices: Vec<IndexSpec>,
    /// Value encoder. Present makes the collection segmented.
    pub encoder: Option<Encoder>,
    /// Record a history entry for every write and delete.
    pub history: bool,
    /// Custom document id generator; ULID when absent.
    pub id_generator: Option<IdGenerator>,
}

impl CollectionOptions {
    /// Empty configuration.
    pub fn new() -> Self {
        CollectionOptions::default()
    }

    /// Add a unique index.
    pub fn primary_index(mut self, field: impl Into<String>) -> Self {
        self.indices.push(IndexSpec::primary(field));
        self
    }

    /// Add a non-unique index.
    pub fn secondary_index(mut self, field: impl Into<String>) -> Self {
        self.indices.push(IndexSpec::secondary(field));
        self
    }

    /// Store values through an encoder (enables segmentation).
    pub fn encoder(mut self, encoder: Encoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Keep a write/delete history log.
    pub fn history(mut self) -> Self {
        self.history = true;
        self
    }

    /// Use a custom id generator.
    pub fn id_generator(mut self, generate: IdGenerator) -> Self {
        self.id_generator = Some(generate);
        self
    }
}

/// Filter applied to candidate documents during traversal.
pub type DocumentFilter<T> = Arc<dyn Fn(&Document<T>) -> bool + Send + Sync>;

/// Options shared by every list-shaped operation.
///
/// Semantics: `limit` caps entries consumed from the store, `filter`
/// drops candidates, `offset` then discards the first matches, `take`
/// caps what is returned.
pub struct ListOptions<T> {
    /// Cap on entries consumed from the store.
    pub limit: Option<usize>,
    /// Matches to discard after filtering.
    pub offset: Option<usize>,
    /// Cap on returned results.
    pub take: Option<usize>,
    /// Inclusive lower id bound.
    pub start_id: Option<KeyPart>,
    /// Exclusive upper id bound.
    pub end_id: Option<KeyPart>,
    /// Resume position from a previous traversal.
    pub cursor: Option<String>,
    /// Walk in descending key order.
    pub reverse: bool,
    /// Read consistency.
    pub consistency: Consistency,
    /// Entries fetched per underlying page.
    pub batch_size: Option<usize>,
    /// Candidate filter.
    pub filter: Option<DocumentFilter<T>>,
}

impl<T> Default for ListOptions<T> {
    fn default() -> Self {
        ListOptions {
            limit: None,
            offset: None,
            take: None,
            start_id: None,
            end_id: None,
            cursor: None,
            reverse: false,
            consistency: Consistency::Strong,
            batch_size: None,
            filter: None,
        }
    }
}

impl<T> ListOptions<T> {
    /// True when the options select every document, enabling fast paths.
    pub fn selects_all(&self) -> bool {
        self.limit.is_none()
            && self.offset.is_none()
            && self.take.is_none()
            && self.start_id.is_none()
            && self.end_id.is_none()
            && self.cursor.is_none()
            && self.filter.is_none()
    }
}

/// Options for `add`/`set`/`write`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Commit retry attempts after a conflict.
    pub retry: usize,
}

/// Options for `update`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// How the patch combines with the existing value.
    pub strategy: MergeStrategy,
    /// Commit retry attempts after a conflict.
    pub retry: usize,
}

/// Options for collection-level `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the message this long before first delivery.
    pub delay: Option<Duration>,
    /// Capture the message under these ids when delivery is exhausted.
    pub ids_if_undelivered: Vec<KeyPart>,
    /// Redelivery backoff in milliseconds per attempt.
    pub backoff_schedule: Option<Vec<u64>>,
    /// Route only to listeners on this topic.
    pub topic: Option<String>,
}

/// One paginated result batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Paginated<R> {
    /// Collected results.
    pub result: Vec<R>,
    /// Resume position, when the traversal stopped early.
    pub cursor: Option<String>,
}

/// One entry of a document's history log.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry<T> {
    /// The document held `value` as of `timestamp`.
    Write {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
        /// Value written.
        value: T,
    },
    /// The document was deleted at `timestamp`.
    Delete {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
}

impl<T> HistoryEntry<T> {
    /// The entry's timestamp.
    pub fn timestamp(&self) -> i64 {
        match self {
            HistoryEntry::Write { timestamp, .. } | HistoryEntry::Delete { timestamp } => {
                *timestamp
            }
        }
    }
}
