//! Batched atomic wrapper
//!
//! Buffers mutations and splits them across several underlying atomic
//! commits whenever an accumulated counter reaches its limit: mutation
//! count, estimated payload bytes, accumulated key bytes, or check
//! count. Used by bulk paths (delete fan-out, `delete_many`, `wipe`)
//! where cross-batch atomicity is not required. Operations that must be
//! single-atomic, such as a document write with its index entries, go through
//! [`kvdex_kv::AtomicOp`] directly.

use kvdex_core::limits::{
    MUTATION_ENQUEUE_OVERHEAD, MUTATION_SET_OVERHEAD, MUTATION_SMALL_OVERHEAD,
};
use kvdex_core::{CommitResult, KvKey, KvLimits, KvValue, KvdexResult, Versionstamp};
use kvdex_kv::{AtomicPayload, Backend, Check, EnqueueOptions, Mutation};
use std::sync::Arc;
use tracing::debug;

/// Mutation buffer that respects per-commit limits by splitting.
pub struct BatchedAtomic {
    backend: Arc<dyn Backend>,
    limits: Arc<KvLimits>,
    full: Vec<AtomicPayload>,
    current: AtomicPayload,
    size: usize,
    key_bytes: usize,
}

impl BatchedAtomic {
    /// Start an empty buffer.
    pub fn new(backend: Arc<dyn Backend>, limits: Arc<KvLimits>) -> Self {
        BatchedAtomic {
            backend,
            limits,
            full: Vec::new(),
            current: AtomicPayload::default(),
            size: 0,
            key_bytes: 0,
        }
    }

    fn rotate_if_needed(&mut self) {
        let limits = &self.limits;
        if self.current.mutations.len() >= limits.atomic_mutation_limit
            || self.current.checks.len() >= limits.atomic_check_limit
            || self.size >= limits.atomic_size_limit
            || self.key_bytes >= limits.atomic_key_size_limit
        {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        if !self.current.is_empty() {
            self.full.push(std::mem::take(&mut self.current));
        }
        self.size = 0;
        self.key_bytes = 0;
    }

    fn push_mutation(&mut self, mutation: Mutation, estimated_size: usize) {
        if let Some(key) = mutation.key() {
            self.key_bytes += key.byte_size();
        }
        self.size += estimated_size;
        self.current.mutations.push(mutation);
        self.rotate_if_needed();
    }

    /// Buffer a write.
    pub fn set(&mut self, key: KvKey, value: KvValue) {
        self.push_mutation(
            Mutation::Set {
                key,
                value,
                expire_in: None,
            },
            MUTATION_SET_OVERHEAD,
        );
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: KvKey) {
        self.push_mutation(Mutation::Delete { key }, MUTATION_SMALL_OVERHEAD);
    }

    /// Buffer a wrapping u64 add.
    pub fn sum(&mut self, key: KvKey, value: u64) {
        self.push_mutation(Mutation::Sum { key, value }, MUTATION_SMALL_OVERHEAD);
    }

    /// Buffer a u64 minimum.
    pub fn min(&mut self, key: KvKey, value: u64) {
        self.push_mutation(Mutation::Min { key, value }, MUTATION_SMALL_OVERHEAD);
    }

    /// Buffer a u64 maximum.
    pub fn max(&mut self, key: KvKey, value: u64) {
        self.push_mutation(Mutation::Max { key, value }, MUTATION_SMALL_OVERHEAD);
    }

    /// Buffer an optimistic check. The check binds only to the batch it
    /// lands in.
    pub fn check(&mut self, key: KvKey, versionstamp: Option<Versionstamp>) {
        self.key_bytes += key.byte_size();
        self.size += MUTATION_SMALL_OVERHEAD;
        self.current.checks.push(Check { key, versionstamp });
        self.rotate_if_needed();
    }

    /// Buffer an enqueue.
    pub fn enqueue(&mut self, value: KvValue, options: EnqueueOptions) {
        let per_key: usize = options
            .keys_if_undelivered
            .iter()
            .map(KvKey::byte_size)
            .sum();
        self.push_mutation(
            Mutation::Enqueue { value, options },
            MUTATION_ENQUEUE_OVERHEAD + per_key,
        );
    }

    /// Number of batches this buffer would commit right now.
    pub fn batch_count(&self) -> usize {
        self.full.len() + usize::from(!self.current.is_empty())
    }

    /// Commit all batches. The result is `Committed` only when every
    /// batch committed; the versionstamp is the last batch's.
    pub fn commit(mut self) -> KvdexResult<CommitResult> {
        self.rotate();
        let batches = std::mem::take(&mut self.full);
        debug!(batches = batches.len(), "committing batched atomic");
        let mut last = None;
        for payload in batches {
            match self.backend.commit(payload)? {
                CommitResult::Committed { versionstamp } => last = Some(versionstamp),
                CommitResult::Conflict => return Ok(CommitResult::Conflict),
            }
        }
        Ok(CommitResult::Committed {
            versionstamp: last.unwrap_or_else(|| Versionstamp::from_counter(0)),
        })
    }
}
