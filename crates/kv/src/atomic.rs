//! Atomic operation building
//!
//! An atomic operation is a list of optimistic checks plus a FIFO list of
//! mutations, committed as one unit. [`AtomicOp`] is the fluent builder;
//! the buffered [`AtomicPayload`] is what a [`crate::Backend`] consumes.

use crate::backend::{Backend, EnqueueOptions, SetOptions};
use kvdex_core::{CommitResult, KvKey, KvValue, KvdexResult, Versionstamp};
use std::sync::Arc;

/// Optimistic concurrency check: the key must hold exactly this
/// versionstamp at commit time (`None` = the key must be vacant).
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    /// Key under check.
    pub key: KvKey,
    /// Expected versionstamp, `None` for "must not exist".
    pub versionstamp: Option<Versionstamp>,
}

/// One buffered mutation.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Write a value, optionally with a TTL.
    Set {
        /// Target key.
        key: KvKey,
        /// Value to store.
        value: KvValue,
        /// Delete the key this long after the commit.
        expire_in: Option<std::time::Duration>,
    },
    /// Delete a key.
    Delete {
        /// Target key.
        key: KvKey,
    },
    /// Wrapping add into a u64 counter value (vacant counts as zero).
    Sum {
        /// Target key.
        key: KvKey,
        /// Operand.
        value: u64,
    },
    /// Keep the smaller of the stored and given u64.
    Min {
        /// Target key.
        key: KvKey,
        /// Operand.
        value: u64,
    },
    /// Keep the larger of the stored and given u64.
    Max {
        /// Target key.
        key: KvKey,
        /// Operand.
        value: u64,
    },
    /// Enqueue a message as part of the commit.
    Enqueue {
        /// Message value.
        value: KvValue,
        /// Delivery options.
        options: EnqueueOptions,
    },
}

impl Mutation {
    /// The key this mutation touches, if it touches one.
    pub fn key(&self) -> Option<&KvKey> {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Delete { key }
            | Mutation::Sum { key, .. }
            | Mutation::Min { key, .. }
            | Mutation::Max { key, .. } => Some(key),
            Mutation::Enqueue { .. } => None,
        }
    }
}

/// A buffered atomic operation, ready for [`Backend::commit`].
#[derive(Debug, Clone, Default)]
pub struct AtomicPayload {
    /// Optimistic checks, all of which must pass.
    pub checks: Vec<Check>,
    /// Mutations, applied in FIFO order on success.
    pub mutations: Vec<Mutation>,
}

impl AtomicPayload {
    /// True when the payload contains no checks and no mutations.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.mutations.is_empty()
    }
}

/// Fluent builder over an [`AtomicPayload`], bound to a backend handle.
pub struct AtomicOp {
    backend: Arc<dyn Backend>,
    payload: AtomicPayload,
}

impl AtomicOp {
    /// Start an empty atomic operation.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        AtomicOp {
            backend,
            payload: AtomicPayload::default(),
        }
    }

    /// Add an optimistic check.
    pub fn check(mut self, key: KvKey, versionstamp: Option<Versionstamp>) -> Self {
        self.payload.checks.push(Check { key, versionstamp });
        self
    }

    /// Buffer a write.
    pub fn set(self, key: KvKey, value: KvValue) -> Self {
        self.set_with_options(key, value, SetOptions::default())
    }

    /// Buffer a write with options.
    pub fn set_with_options(mut self, key: KvKey, value: KvValue, options: SetOptions) -> Self {
        self.payload.mutations.push(Mutation::Set {
            key,
            value,
            expire_in: options.expire_in,
        });
        self
    }

    /// Buffer a delete.
    pub fn delete(mut self, key: KvKey) -> Self {
        self.payload.mutations.push(Mutation::Delete { key });
        self
    }

    /// Buffer a wrapping u64 add.
    pub fn sum(mut self, key: KvKey, value: u64) -> Self {
        self.payload.mutations.push(Mutation::Sum { key, value });
        self
    }

    /// Buffer a u64 minimum.
    pub fn min(mut self, key: KvKey, value: u64) -> Self {
        self.payload.mutations.push(Mutation::Min { key, value });
        self
    }

    /// Buffer a u64 maximum.
    pub fn max(mut self, key: KvKey, value: u64) -> Self {
        self.payload.mutations.push(Mutation::Max { key, value });
        self
    }

    /// Buffer an enqueue.
    pub fn enqueue(mut self, value: KvValue, options: EnqueueOptions) -> Self {
        self.payload.mutations.push(Mutation::Enqueue { value, options });
        self
    }

    /// Number of buffered mutations.
    pub fn mutation_count(&self) -> usize {
        self.payload.mutations.len()
    }

    /// Number of buffered checks.
    pub fn check_count(&self) -> usize {
        self.payload.checks.len()
    }

    /// Take the buffered payload without committing.
    pub fn into_payload(self) -> AtomicPayload {
        self.payload
    }

    /// Commit all buffered operations as one unit.
    pub fn commit(self) -> KvdexResult<CommitResult> {
        self.backend.commit(self.payload)
    }
}
