//! The KV primitive contract
//!
//! Everything the engine needs from an ordered KV store, and nothing
//! more. A backend implementation is shared behind `Arc<dyn Backend>`;
//! all engine facades hold that handle and no other state.

use crate::atomic::AtomicPayload;
use crate::selector::{ListPage, ListSelector, PageRequest};
use crate::watch::WatchStream;
use kvdex_core::{CommitResult, KvKey, KvValue, KvdexResult, Versionstamp};
use std::sync::Arc;
use std::time::Duration;

/// Read consistency requested by a caller.
///
/// The in-memory backend always serves strong reads; the distinction
/// matters only for replicated native backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Read the latest committed state.
    #[default]
    Strong,
    /// Allow a stale read.
    Eventual,
}

/// One read result. A missing key yields `value: None, versionstamp: None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The key that was read.
    pub key: KvKey,
    /// The stored value, when present.
    pub value: Option<KvValue>,
    /// Versionstamp of the last write, when present.
    pub versionstamp: Option<Versionstamp>,
}

impl Entry {
    /// An entry for a key with no stored value.
    pub fn missing(key: KvKey) -> Self {
        Entry {
            key,
            value: None,
            versionstamp: None,
        }
    }

    /// True when the key held a value at read time.
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Options for a single `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Delete the key this long after the write.
    pub expire_in: Option<Duration>,
}

/// Options for `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the message this long before first delivery.
    pub delay: Option<Duration>,
    /// After the retry schedule is exhausted, write the message value to
    /// each of these keys.
    pub keys_if_undelivered: Vec<KvKey>,
    /// Redelivery backoff in milliseconds per attempt. Falls back to the
    /// backend's configured schedule.
    pub backoff_schedule: Option<Vec<u64>>,
}

/// The process-wide queue dispatcher. Returning `Err` triggers redelivery
/// per the backoff schedule; exhausting the schedule captures the message
/// under its undelivered keys.
pub type QueueHandler = Arc<dyn Fn(KvValue) -> KvdexResult<()> + Send + Sync>;

/// The ordered KV store contract the engine is built on.
pub trait Backend: Send + Sync + 'static {
    /// Read one key.
    fn get(&self, key: &KvKey, consistency: Consistency) -> KvdexResult<Entry>;

    /// Read several keys in one call. Callers must slice requests at the
    /// configured `get_many_key_limit`; backends reject larger batches.
    fn get_many(&self, keys: &[KvKey], consistency: Consistency) -> KvdexResult<Vec<Entry>>;

    /// Write one key.
    fn set(&self, key: &KvKey, value: KvValue, options: SetOptions) -> KvdexResult<CommitResult>;

    /// Delete one key. Deleting a missing key is a no-op.
    fn delete(&self, key: &KvKey) -> KvdexResult<()>;

    /// Fetch one page of a range listing. Use [`crate::ListIter`] for
    /// lazy traversal across pages.
    fn list_page(&self, selector: &ListSelector, request: &PageRequest) -> KvdexResult<ListPage>;

    /// Commit a buffered atomic operation: all contained mutations apply,
    /// or none do. Prefer building payloads through [`crate::AtomicOp`].
    fn commit(&self, payload: AtomicPayload) -> KvdexResult<CommitResult>;

    /// Enqueue a value for at-least-once delivery to the registered
    /// dispatcher.
    fn enqueue(&self, value: KvValue, options: EnqueueOptions) -> KvdexResult<CommitResult>;

    /// Register the process-wide queue dispatcher. Messages enqueued
    /// before registration are held, not dropped. A second registration
    /// replaces the first.
    fn listen_queue(&self, handler: QueueHandler) -> KvdexResult<()>;

    /// Open a change stream over a set of keys. Each emission carries one
    /// entry per watched key, in the order given.
    fn watch(&self, keys: Vec<KvKey>) -> KvdexResult<WatchStream>;

    /// Stop background work and close all watch streams.
    fn close(&self);
}
