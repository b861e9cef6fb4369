//! Cross-collection atomic builder
//!
//! Accumulates operations against multiple collections and commits them
//! as one underlying atomic transaction, in three phases:
//!
//! 1. **Plan**: every `add`/`set`/`write`/`delete` is turned into
//!    checks and mutations as it is registered.
//! 2. **Gate**: deleting an indexable document requires reading its
//!    live index entries, which happens outside the commit; interleaving
//!    an indexable insert and delete on the same collection in one
//!    commit would race that read. Commits whose insert and delete
//!    collection sets intersect are rejected outright.
//! 3. **Commit**: the buffered payload commits as one unit; on success
//!    a post-commit pass deletes the index entries of each deleted
//!    document, one best-effort atomic per document. A failure there is
//!    recoverable: a primary index entry cannot block re-insertion once
//!    its backing document is gone.
//!
//! Collections declaring an encoder are rejected at builder time:
//! segmented values cannot honor the single-atomic contract.

use crate::collection::options::EnqueueOptions;
use crate::collection::{history_write_entry, Collection};
use crate::envelope;
use crate::ids;
use kvdex_core::{
    to_value, CommitResult, KeyPart, KvKey, KvValue, KvdexError, KvdexResult, Versionstamp,
};
use kvdex_kv::{AtomicPayload, Backend, Check, Mutation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

type PrepareDeleteFn = Box<dyn FnOnce() -> KvdexResult<Option<AtomicPayload>> + Send>;

struct AtomicState {
    backend: Arc<dyn Backend>,
    payload: AtomicPayload,
    insert_collections: HashSet<KvKey>,
    delete_collections: HashSet<KvKey>,
    prepare_deletes: Vec<PrepareDeleteFn>,
}

/// One deferred operation for [`AtomicBuilder::mutate`].
pub enum AtomicMutation<T> {
    /// Insert under a generated id.
    Add {
        /// Document value.
        value: T,
    },
    /// Insert under an explicit id, requiring vacancy.
    Set {
        /// Document id.
        id: KeyPart,
        /// Document value.
        value: T,
    },
    /// Insert under an explicit id without an id check.
    Write {
        /// Document id.
        id: KeyPart,
        /// Document value.
        value: T,
    },
    /// Delete a document.
    Delete {
        /// Document id.
        id: KeyPart,
    },
    /// Optimistic check on a document entry.
    Check {
        /// Document id.
        id: KeyPart,
        /// Expected versionstamp, `None` for vacancy.
        versionstamp: Option<Versionstamp>,
    },
    /// Wrapping add into a u64 document.
    Sum {
        /// Document id.
        id: KeyPart,
        /// Operand.
        value: u64,
    },
    /// Keep the smaller u64.
    Min {
        /// Document id.
        id: KeyPart,
        /// Operand.
        value: u64,
    },
    /// Keep the larger u64.
    Max {
        /// Document id.
        id: KeyPart,
        /// Operand.
        value: u64,
    },
}

/// Fluent composer of one all-or-nothing commit across collections.
pub struct AtomicBuilder<T> {
    state: AtomicState,
    collection: Collection<T>,
}

impl<T> std::fmt::Debug for AtomicBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBuilder").finish_non_exhaustive()
    }
}

impl<T> AtomicBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start a builder in `collection`'s context.
    pub fn new(collection: &Collection<T>) -> KvdexResult<Self> {
        reject_encoded(collection)?;
        Ok(AtomicBuilder {
            state: AtomicState {
                backend: Arc::clone(collection.backend()),
                payload: AtomicPayload::default(),
                insert_collections: HashSet::new(),
                delete_collections: HashSet::new(),
                prepare_deletes: Vec::new(),
            },
            collection: collection.clone(),
        })
    }

    /// Switch the current collection context, keeping buffered work.
    pub fn select<U>(self, collection: &Collection<U>) -> KvdexResult<AtomicBuilder<U>>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        reject_encoded(collection)?;
        Ok(AtomicBuilder {
            state: self.state,
            collection: collection.clone(),
        })
    }

    /// Buffer an insert under a generated id.
    pub fn add(mut self, value: &T) -> KvdexResult<Self> {
        let doc_value = to_value(value)?;
        let id = self.collection.generate_id(&doc_value);
        self.plan_insert(&id, doc_value, true)?;
        Ok(self)
    }

    /// Buffer an insert requiring id vacancy.
    pub fn set(mut self, id: &KeyPart, value: &T) -> KvdexResult<Self> {
        self.plan_insert(id, to_value(value)?, true)?;
        Ok(self)
    }

    /// Buffer an insert without an id check. Index vacancy checks still
    /// apply.
    pub fn write(mut self, id: &KeyPart, value: &T) -> KvdexResult<Self> {
        self.plan_insert(id, to_value(value)?, false)?;
        Ok(self)
    }

    /// Buffer a document delete, deferring index-entry enumeration to
    /// commit time.
    pub fn delete(mut self, id: &KeyPart) -> KvdexResult<Self> {
        let id_key = self.collection.id_key(id);
        self.state
            .payload
            .mutations
            .push(Mutation::Delete { key: id_key.clone() });
        if self.collection.keeps_history() {
            let (key, value) = self.collection.history_delete_entry(id);
            self.state.payload.mutations.push(Mutation::Set {
                key,
                value,
                expire_in: None,
            });
        }
        if self.collection.is_indexable() {
            self.state
                .delete_collections
                .insert(self.collection.base_key().clone());
            let collection = self.collection.clone();
            let backend = Arc::clone(self.collection.backend());
            let id = id.clone();
            self.state.prepare_deletes.push(Box::new(move || {
                let entry = backend.get(&id_key, kvdex_kv::Consistency::Strong)?;
                let Some(stored) = entry.value else {
                    return Ok(None);
                };
                let mut payload = AtomicPayload::default();
                for index in collection.index_entries_for(&id, &stored, &stored)? {
                    payload.mutations.push(Mutation::Delete { key: index.key });
                }
                Ok(Some(payload))
            }));
        }
        Ok(self)
    }

    /// Buffer an optimistic check on a document entry.
    pub fn check(mut self, id: &KeyPart, versionstamp: Option<Versionstamp>) -> KvdexResult<Self> {
        self.state.payload.checks.push(Check {
            key: self.collection.id_key(id),
            versionstamp,
        });
        Ok(self)
    }

    /// Buffer a wrapping u64 add on a document.
    pub fn sum(mut self, id: &KeyPart, value: u64) -> KvdexResult<Self> {
        let key = self.collection.id_key(id);
        self.state.payload.mutations.push(Mutation::Sum { key, value });
        Ok(self)
    }

    /// Buffer a u64 minimum on a document.
    pub fn min(mut self, id: &KeyPart, value: u64) -> KvdexResult<Self> {
        let key = self.collection.id_key(id);
        self.state.payload.mutations.push(Mutation::Min { key, value });
        Ok(self)
    }

    /// Buffer a u64 maximum on a document.
    pub fn max(mut self, id: &KeyPart, value: u64) -> KvdexResult<Self> {
        let key = self.collection.id_key(id);
        self.state.payload.mutations.push(Mutation::Max { key, value });
        Ok(self)
    }

    /// Buffer an enqueue routed to the current collection's listeners.
    pub fn enqueue<D: Serialize>(
        mut self,
        data: &D,
        options: &EnqueueOptions,
    ) -> KvdexResult<Self> {
        let handler_id =
            envelope::handler_id(self.collection.base_key(), options.topic.as_deref());
        let message = envelope::wrap(to_value(data)?, handler_id);
        let keys_if_undelivered = options
            .ids_if_undelivered
            .iter()
            .map(|id| {
                self.collection
                    .collection_keys()
                    .undelivered
                    .extended(id.clone())
            })
            .collect();
        self.state.payload.mutations.push(Mutation::Enqueue {
            value: message,
            options: kvdex_kv::EnqueueOptions {
                delay: options.delay,
                keys_if_undelivered,
                backoff_schedule: options.backoff_schedule.clone(),
            },
        });
        Ok(self)
    }

    /// Multiplex over the typed operations.
    pub fn mutate(
        mut self,
        mutations: impl IntoIterator<Item = AtomicMutation<T>>,
    ) -> KvdexResult<Self> {
        for mutation in mutations {
            self = match mutation {
                AtomicMutation::Add { value } => self.add(&value)?,
                AtomicMutation::Set { id, value } => self.set(&id, &value)?,
                AtomicMutation::Write { id, value } => self.write(&id, &value)?,
                AtomicMutation::Delete { id } => self.delete(&id)?,
                AtomicMutation::Check { id, versionstamp } => self.check(&id, versionstamp)?,
                AtomicMutation::Sum { id, value } => self.sum(&id, value)?,
                AtomicMutation::Min { id, value } => self.min(&id, value)?,
                AtomicMutation::Max { id, value } => self.max(&id, value)?,
            };
        }
        Ok(self)
    }

    /// Run the collision gate, commit, and the post-commit index sweep.
    pub fn commit(self) -> KvdexResult<CommitResult> {
        let AtomicState {
            backend,
            payload,
            insert_collections,
            delete_collections,
            prepare_deletes,
        } = self.state;

        if insert_collections
            .intersection(&delete_collections)
            .next()
            .is_some()
        {
            debug!("atomic commit rejected by collision gate");
            return Ok(CommitResult::Conflict);
        }

        let mut index_sweeps = Vec::new();
        for prepare in prepare_deletes {
            match prepare() {
                Ok(Some(sweep)) => index_sweeps.push(sweep),
                Ok(None) => {}
                Err(err) => debug!(error = %err, "prepare-delete read failed"),
            }
        }

        let result = backend.commit(payload)?;
        if result.is_ok() {
            for sweep in index_sweeps {
                if let Err(err) = backend.commit(sweep) {
                    debug!(error = %err, "post-commit index sweep failed");
                }
            }
        }
        Ok(result)
    }

    fn plan_insert(
        &mut self,
        id: &KeyPart,
        doc_value: KvValue,
        check_id: bool,
    ) -> KvdexResult<()> {
        let id_key = self.collection.id_key(id);
        if check_id {
            self.state.payload.checks.push(Check {
                key: id_key.clone(),
                versionstamp: None,
            });
        }
        if self.collection.keeps_history() {
            let key = self
                .collection
                .collection_keys()
                .history
                .extended(id.clone())
                .extended(ids::time_id());
            self.state.payload.mutations.push(Mutation::Set {
                key,
                value: history_write_entry(doc_value.clone()),
                expire_in: None,
            });
        }
        self.state.payload.mutations.push(Mutation::Set {
            key: id_key,
            value: doc_value.clone(),
            expire_in: None,
        });
        if self.collection.is_indexable() {
            self.state
                .insert_collections
                .insert(self.collection.base_key().clone());
            for index in self.collection.index_entries_for(id, &doc_value, &doc_value)? {
                if index.kind == crate::collection::options::IndexKind::Primary {
                    self.state.payload.checks.push(Check {
                        key: index.key.clone(),
                        versionstamp: None,
                    });
                }
                self.state.payload.mutations.push(Mutation::Set {
                    key: index.key,
                    value: index.value,
                    expire_in: None,
                });
            }
        }
        Ok(())
    }
}

fn reject_encoded<U>(collection: &Collection<U>) -> KvdexResult<()>
where
    U: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    if collection.is_encoded() {
        return Err(KvdexError::invalid_collection(
            "atomic operations are not supported on encoded collections",
        ));
    }
    Ok(())
}
