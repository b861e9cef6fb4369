//! The collection engine
//!
//! A `Collection<T>` is a stateless, cloneable facade over the shared
//! backend handle: its only state is its key prefixes and configuration.
//! Documents are parsed through the serde bridge at the boundary; inside
//! the engine everything is a `KvValue`.
//!
//! ## Write path
//!
//! Every write goes through one internal plan: check id vacancy, emit
//! segment writes (encoded collections), append the history entry, store
//! the id entry, then set every index entry (unique entries guarded by
//! their own vacancy checks) and commit the whole plan as one atomic
//! operation. A conflicting commit either retries, fails cleanly, or (for
//! `write`) probes whether the id or an index collided and only
//! overwrites in the former case.
//!
//! ## Read path
//!
//! Readers find the id entry, follow the segment sentinel when present
//! (fetching chunks through `get_many`, sliced at the configured limit),
//! decompress, deserialize, and parse through the model.

pub mod options;

use crate::batch::BatchedAtomic;
use crate::envelope::{self, QueueRegistry};
use crate::ids;
use crate::keys::{self, CollectionKeys, IndexEntry};
use crate::watch::{self, WatchHandle, WatchOptions};
use kvdex_core::{
    from_value, to_value, value::merge, CommitResult, Document, KeyPart, KvKey, KvLimits, KvValue,
    KvdexError, KvdexResult, WriteResult,
};
use kvdex_kv::{
    AtomicPayload, Backend, Check, Consistency, Entry, ListIter, ListSelector, Mutation,
};
use options::{
    CollectionOptions, EnqueueOptions, HistoryEntry, IndexKind, ListOptions, Paginated,
    UpdateOptions, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

const SEGMENT_IDS_FIELD: &str = "ids";
const SEGMENT_IS_BYTES_FIELD: &str = "is_bytes";

const HISTORY_TYPE_FIELD: &str = "type";
const HISTORY_TIMESTAMP_FIELD: &str = "timestamp";
const HISTORY_VALUE_FIELD: &str = "value";
const HISTORY_TYPE_WRITE: &str = "write";
const HISTORY_TYPE_DELETE: &str = "delete";

const DEFAULT_BATCH_SIZE: usize = 500;

/// Typed document container bound to a key prefix.
pub struct Collection<T> {
    backend: Arc<dyn Backend>,
    limits: Arc<KvLimits>,
    queue: Arc<QueueRegistry>,
    keys: Arc<CollectionKeys>,
    options: Arc<CollectionOptions>,
    _model: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Collection {
            backend: Arc::clone(&self.backend),
            limits: Arc::clone(&self.limits),
            queue: Arc::clone(&self.queue),
            keys: Arc::clone(&self.keys),
            options: Arc::clone(&self.options),
            _model: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Bind a collection to a user path. Fails on reserved path parts.
    pub fn new(
        backend: Arc<dyn Backend>,
        limits: Arc<KvLimits>,
        queue: Arc<QueueRegistry>,
        path: &KvKey,
        options: CollectionOptions,
    ) -> KvdexResult<Self> {
        Ok(Collection {
            backend,
            limits,
            queue,
            keys: Arc::new(CollectionKeys::new(path)?),
            options: Arc::new(options),
            _model: PhantomData,
        })
    }

    /// The collection's full key prefix, root part included.
    pub fn base_key(&self) -> &KvKey {
        &self.keys.base
    }

    /// True when the collection declares any index.
    pub fn is_indexable(&self) -> bool {
        !self.options.indices.is_empty()
    }

    /// True when the collection stores values through an encoder.
    pub fn is_encoded(&self) -> bool {
        self.options.encoder.is_some()
    }

    /// True when writes and deletes are logged.
    pub fn keeps_history(&self) -> bool {
        self.options.history
    }

    pub(crate) fn collection_keys(&self) -> &Arc<CollectionKeys> {
        &self.keys
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn id_key(&self, id: &KeyPart) -> KvKey {
        self.keys.id.extended(id.clone())
    }

    pub(crate) fn generate_id(&self, value: &KvValue) -> KeyPart {
        match &self.options.id_generator {
            Some(generate) => generate(value),
            None => ids::time_id(),
        }
    }

    fn batch_size(&self, options_batch: Option<usize>) -> usize {
        options_batch.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a document by id.
    pub fn find(&self, id: &KeyPart) -> KvdexResult<Option<Document<T>>> {
        let entry = self.backend.get(&self.id_key(id), Consistency::Strong)?;
        self.decode_entry(&entry)
    }

    /// Look up several documents by id. Missing ids are skipped.
    pub fn find_many(&self, ids: &[KeyPart]) -> KvdexResult<Vec<Document<T>>> {
        let keys: Vec<KvKey> = ids.iter().map(|id| self.id_key(id)).collect();
        let mut documents = Vec::new();
        for slice in keys.chunks(self.limits.get_many_key_limit) {
            for entry in self.backend.get_many(slice, Consistency::Strong)? {
                if let Some(doc) = self.decode_entry(&entry)? {
                    documents.push(doc);
                }
            }
        }
        Ok(documents)
    }

    /// Look up the single document carrying `value` in a unique index.
    pub fn find_by_primary_index<V: Serialize>(
        &self,
        field: &str,
        value: &V,
    ) -> KvdexResult<Option<Document<T>>> {
        let key = self.primary_index_key(field, &to_value(value)?)?;
        let entry = self.backend.get(&key, Consistency::Strong)?;
        let Some(stored) = entry.value else {
            return Ok(None);
        };
        let (id, stored_value) = split_primary_entry(&stored)?;
        let doc_value = self.resolve_stored(&id, &stored_value)?;
        Ok(Some(Document {
            versionstamp: entry
                .versionstamp
                .ok_or_else(|| KvdexError::corrupted("index entry without versionstamp"))?,
            value: from_value(doc_value)?,
            id,
        }))
    }

    /// List the documents carrying `value` in a non-unique index.
    pub fn find_by_secondary_index<V: Serialize>(
        &self,
        field: &str,
        value: &V,
        options: &ListOptions<T>,
    ) -> KvdexResult<Paginated<Document<T>>> {
        let prefix = self.secondary_index_prefix(field, &to_value(value)?)?;
        self.handle_many(prefix, options, Ok)
    }

    /// List documents in id-key order.
    pub fn get_many(&self, options: &ListOptions<T>) -> KvdexResult<Paginated<Document<T>>> {
        self.handle_many(self.keys.id.clone(), options, Ok)
    }

    /// Visit every selected document.
    pub fn for_each(
        &self,
        options: &ListOptions<T>,
        mut f: impl FnMut(&Document<T>),
    ) -> KvdexResult<Option<String>> {
        let page = self.handle_many(self.keys.id.clone(), options, |doc| {
            f(&doc);
            Ok(())
        })?;
        Ok(page.cursor)
    }

    /// Map every selected document through `f`.
    pub fn map<R>(
        &self,
        options: &ListOptions<T>,
        mut f: impl FnMut(Document<T>) -> KvdexResult<R>,
    ) -> KvdexResult<Paginated<R>> {
        self.handle_many(self.keys.id.clone(), options, &mut f)
    }

    /// Count selected documents. Selecting everything skips decoding.
    pub fn count(&self, options: &ListOptions<T>) -> KvdexResult<usize> {
        if options.selects_all() {
            let mut count = 0;
            for entry in self.id_iter(None, None, false, options.consistency, None)? {
                entry?;
                count += 1;
            }
            return Ok(count);
        }
        let page = self.handle_many(self.keys.id.clone(), options, |_| Ok(()))?;
        Ok(page.result.len())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert a document under a generated id.
    pub fn add(&self, value: &T, options: &WriteOptions) -> KvdexResult<WriteResult> {
        let doc_value = to_value(value)?;
        let id = self.generate_id(&doc_value);
        self.set_doc_value(id, doc_value, options, false)
    }

    /// Insert a document under an explicit id. Fails on id collision.
    pub fn set(&self, id: &KeyPart, value: &T, options: &WriteOptions) -> KvdexResult<WriteResult> {
        self.set_doc_value(id.clone(), to_value(value)?, options, false)
    }

    /// Insert or overwrite a document under an explicit id. An id
    /// collision overwrites; an index collision fails.
    pub fn write(
        &self,
        id: &KeyPart,
        value: &T,
        options: &WriteOptions,
    ) -> KvdexResult<WriteResult> {
        self.set_doc_value(id.clone(), to_value(value)?, options, true)
    }

    /// Patch a document. Object values merge per the strategy; everything
    /// else is replaced. Fails cleanly when the new value would collide
    /// with an index entry of another document.
    pub fn update<P: Serialize>(
        &self,
        id: &KeyPart,
        patch: &P,
        options: &UpdateOptions,
    ) -> KvdexResult<WriteResult> {
        let entry = self.backend.get(&self.id_key(id), Consistency::Strong)?;
        let Some(stored) = entry.value else {
            return Ok(WriteResult::Conflict);
        };
        let existing = self.resolve_stored(id, &stored)?;
        let patch_value = to_value(patch)?;
        let merged = merge(&existing, patch_value, options.strategy);

        if self.is_indexable() && self.has_index_collision(id, &merged)? {
            return Ok(WriteResult::Conflict);
        }

        // replace-then-rewrite: the old entry goes away without a history
        // delete, then the merged value is written fresh
        self.delete_docs(std::slice::from_ref(id), false)?;
        self.set_doc_value(
            id.clone(),
            merged,
            &WriteOptions {
                retry: options.retry,
            },
            true,
        )
    }

    /// Update the document found through a unique index.
    pub fn update_by_primary_index<V: Serialize, P: Serialize>(
        &self,
        field: &str,
        value: &V,
        patch: &P,
        options: &UpdateOptions,
    ) -> KvdexResult<WriteResult> {
        match self.find_by_primary_index(field, value)? {
            Some(doc) => self.update(&doc.id, patch, options),
            None => Ok(WriteResult::Conflict),
        }
    }

    /// Update every document found through a non-unique index.
    pub fn update_by_secondary_index<V: Serialize, P: Serialize>(
        &self,
        field: &str,
        value: &V,
        patch: &P,
        options: &UpdateOptions,
        list: &ListOptions<T>,
    ) -> KvdexResult<Paginated<WriteResult>> {
        let prefix = self.secondary_index_prefix(field, &to_value(value)?)?;
        self.handle_many(prefix, list, |doc| self.update(&doc.id, patch, options))
    }

    /// Update every selected document.
    pub fn update_many<P: Serialize>(
        &self,
        patch: &P,
        options: &UpdateOptions,
        list: &ListOptions<T>,
    ) -> KvdexResult<Paginated<WriteResult>> {
        self.handle_many(self.keys.id.clone(), list, |doc| {
            self.update(&doc.id, patch, options)
        })
    }

    // ========================================================================
    // Deletes
    // ========================================================================

    /// Delete documents by id, along with their segments and index
    /// entries. Records history delete entries when enabled.
    pub fn delete(&self, ids: &[KeyPart]) -> KvdexResult<()> {
        self.delete_docs(ids, true)
    }

    /// Delete the document found through a unique index.
    pub fn delete_by_primary_index<V: Serialize>(
        &self,
        field: &str,
        value: &V,
    ) -> KvdexResult<()> {
        if let Some(doc) = self.find_by_primary_index(field, value)? {
            self.delete(std::slice::from_ref(&doc.id))?;
        }
        Ok(())
    }

    /// Delete every document found through a non-unique index.
    pub fn delete_by_secondary_index<V: Serialize>(
        &self,
        field: &str,
        value: &V,
        options: &ListOptions<T>,
    ) -> KvdexResult<()> {
        let prefix = self.secondary_index_prefix(field, &to_value(value)?)?;
        self.handle_many(prefix, options, |doc| {
            self.delete(std::slice::from_ref(&doc.id))
        })?;
        Ok(())
    }

    /// Delete every selected document. Selecting everything takes the
    /// fast path: one scan of the id prefix plus a segment sweep that
    /// also clears orphans.
    pub fn delete_many(&self, options: &ListOptions<T>) -> KvdexResult<Option<String>> {
        if !options.selects_all() {
            let page = self.handle_many(self.keys.id.clone(), options, |doc| {
                self.delete(std::slice::from_ref(&doc.id))
            })?;
            return Ok(page.cursor);
        }

        let mut batch = BatchedAtomic::new(Arc::clone(&self.backend), Arc::clone(&self.limits));
        for entry in self.id_iter(None, None, false, options.consistency, None)? {
            let entry = entry?;
            let Some(stored) = entry.value.as_ref() else {
                continue;
            };
            let id = doc_id_from_key(&entry.key)?;
            if self.is_indexable() {
                let doc_value = self.resolve_stored(&id, stored)?;
                for index in self.index_entries_for(&id, &doc_value, &doc_value)? {
                    batch.delete(index.key);
                }
            }
            batch.delete(entry.key.clone());
            if self.options.history {
                let (key, value) = self.history_delete_entry(&id);
                batch.set(key, value);
            }
        }
        if self.is_encoded() {
            // sweeping the whole segment prefix also clears orphans left
            // by failed writes
            let iter = ListIter::new(
                Arc::clone(&self.backend),
                ListSelector::Prefix {
                    prefix: self.keys.segment.clone(),
                },
                None,
                None,
                false,
                options.consistency,
                DEFAULT_BATCH_SIZE,
            );
            for entry in iter {
                batch.delete(entry?.key);
            }
        }
        batch.commit()?;
        Ok(None)
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Read a document's history log in insertion order.
    pub fn find_history(&self, id: &KeyPart) -> KvdexResult<Vec<HistoryEntry<T>>> {
        if !self.options.history {
            return Err(KvdexError::invalid_collection(
                "collection does not keep history",
            ));
        }
        let prefix = self.keys.history.extended(id.clone());
        let iter = ListIter::new(
            Arc::clone(&self.backend),
            ListSelector::Prefix { prefix },
            None,
            None,
            false,
            Consistency::Strong,
            DEFAULT_BATCH_SIZE,
        );
        let mut entries = Vec::new();
        for entry in iter {
            let entry = entry?;
            let value = entry
                .value
                .as_ref()
                .ok_or_else(|| KvdexError::corrupted("history entry without value"))?;
            entries.push(self.decode_history_entry(id, &entry.key, value)?);
        }
        Ok(entries)
    }

    fn decode_history_entry(
        &self,
        id: &KeyPart,
        key: &KvKey,
        value: &KvValue,
    ) -> KvdexResult<HistoryEntry<T>> {
        let map = value
            .as_object()
            .ok_or_else(|| KvdexError::corrupted("malformed history entry"))?;
        let timestamp = match map.get(HISTORY_TIMESTAMP_FIELD) {
            Some(KvValue::Timestamp(ms)) => *ms,
            _ => return Err(KvdexError::corrupted("history entry without timestamp")),
        };
        match map.get(HISTORY_TYPE_FIELD) {
            Some(KvValue::String(kind)) if kind == HISTORY_TYPE_WRITE => {
                let stored = map
                    .get(HISTORY_VALUE_FIELD)
                    .ok_or_else(|| KvdexError::corrupted("write history entry without value"))?;
                let value = match (&self.options.encoder, parse_sentinel(stored)) {
                    (Some(_), Some((segment_ids, is_bytes))) => {
                        let time_id = key
                            .last()
                            .cloned()
                            .ok_or_else(|| KvdexError::corrupted("history entry with empty key"))?;
                        let base = self
                            .keys
                            .history_segment
                            .extended(id.clone())
                            .extended(time_id);
                        self.assemble_segments(&base, &segment_ids, is_bytes)?
                    }
                    _ => stored.clone(),
                };
                Ok(HistoryEntry::Write {
                    timestamp,
                    value: from_value(value)?,
                })
            }
            Some(KvValue::String(kind)) if kind == HISTORY_TYPE_DELETE => {
                Ok(HistoryEntry::Delete { timestamp })
            }
            _ => Err(KvdexError::corrupted("history entry with unknown type")),
        }
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Enqueue data for this collection's listeners.
    pub fn enqueue<D: Serialize>(
        &self,
        data: &D,
        options: &EnqueueOptions,
    ) -> KvdexResult<CommitResult> {
        let handler_id = envelope::handler_id(&self.keys.base, options.topic.as_deref());
        let message = envelope::wrap(to_value(data)?, handler_id);
        let keys_if_undelivered = options
            .ids_if_undelivered
            .iter()
            .map(|id| self.keys.undelivered.extended(id.clone()))
            .collect();
        self.backend.enqueue(
            message,
            kvdex_kv::EnqueueOptions {
                delay: options.delay,
                keys_if_undelivered,
                backoff_schedule: options.backoff_schedule.clone(),
            },
        )
    }

    /// Register a listener for this collection's messages. Listeners run
    /// indefinitely; the first registration anywhere activates the
    /// dispatcher.
    pub fn listen_queue<M, F>(&self, handler: F, topic: Option<&str>) -> KvdexResult<()>
    where
        M: DeserializeOwned,
        F: Fn(M) -> KvdexResult<()> + Send + Sync + 'static,
    {
        let handler_id = envelope::handler_id(&self.keys.base, topic);
        self.queue.register(
            handler_id,
            Arc::new(move |value| handler(from_value(value)?)),
        );
        QueueRegistry::activate(&self.queue, &self.backend)
    }

    /// Read a captured undelivered message.
    pub fn find_undelivered<M: DeserializeOwned>(
        &self,
        id: &KeyPart,
    ) -> KvdexResult<Option<Document<M>>> {
        let key = self.keys.undelivered.extended(id.clone());
        let entry = self.backend.get(&key, Consistency::Strong)?;
        let Some(value) = entry.value else {
            return Ok(None);
        };
        let message = envelope::parse(&value)
            .ok_or_else(|| KvdexError::corrupted("malformed undelivered message"))?;
        Ok(Some(Document {
            id: id.clone(),
            versionstamp: entry
                .versionstamp
                .ok_or_else(|| KvdexError::corrupted("undelivered entry without versionstamp"))?,
            value: from_value(message.data)?,
        }))
    }

    /// Delete a captured undelivered message.
    pub fn delete_undelivered(&self, id: &KeyPart) -> KvdexResult<()> {
        self.backend.delete(&self.keys.undelivered.extended(id.clone()))
    }

    // ========================================================================
    // Watch
    // ========================================================================

    /// Invoke `on_change` with the current document whenever `id`'s entry
    /// changes.
    pub fn watch<F>(
        &self,
        id: &KeyPart,
        options: &WatchOptions,
        on_change: F,
    ) -> KvdexResult<WatchHandle>
    where
        F: Fn(Option<Document<T>>) + Send + Sync + 'static,
    {
        self.watch_many(std::slice::from_ref(id), options, move |mut docs| {
            on_change(docs.pop().flatten())
        })
    }

    /// Invoke `on_change` with the current documents whenever any watched
    /// entry changes. Documents arrive in the order the ids were given.
    pub fn watch_many<F>(
        &self,
        ids: &[KeyPart],
        options: &WatchOptions,
        on_change: F,
    ) -> KvdexResult<WatchHandle>
    where
        F: Fn(Vec<Option<Document<T>>>) + Send + Sync + 'static,
    {
        let keys: Vec<KvKey> = ids.iter().map(|id| self.id_key(id)).collect();
        let stream = self.backend.watch(keys)?;
        let collection = self.clone();
        watch::spawn_watcher(
            stream,
            options.raw,
            move |entries| {
                entries
                    .iter()
                    .map(|entry| collection.decode_entry(entry))
                    .collect()
            },
            on_change,
        )
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// The shared list-traversal primitive: walk `prefix`, reconstruct
    /// documents, filter, then run the callback over the collected batch.
    /// Callback failures are batched and raised together after the
    /// traversal.
    fn handle_many<R>(
        &self,
        prefix: KvKey,
        options: &ListOptions<T>,
        mut f: impl FnMut(Document<T>) -> KvdexResult<R>,
    ) -> KvdexResult<Paginated<R>> {
        let start = options.start_id.as_ref().map(|id| prefix.extended(id.clone()));
        let end = options.end_id.as_ref().map(|id| prefix.extended(id.clone()));
        let selector = ListSelector::build(Some(prefix), start, end)?;
        let mut iter = ListIter::new(
            Arc::clone(&self.backend),
            selector,
            options.limit,
            options.cursor.clone(),
            options.reverse,
            options.consistency,
            self.batch_size(options.batch_size),
        );

        let mut documents = Vec::new();
        for entry in iter.by_ref() {
            let entry = entry?;
            let Some(document) = self.decode_entry(&entry)? else {
                continue;
            };
            if let Some(filter) = &options.filter {
                if !filter(&document) {
                    continue;
                }
            }
            documents.push(document);
        }
        let cursor = iter.cursor();

        if let Some(offset) = options.offset {
            documents.drain(..offset.min(documents.len()));
        }
        if let Some(take) = options.take {
            documents.truncate(take);
        }

        let mut result = Vec::with_capacity(documents.len());
        let mut errors = Vec::new();
        for document in documents {
            match f(document) {
                Ok(r) => result.push(r),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return Err(KvdexError::aggregate(errors));
        }
        Ok(Paginated { result, cursor })
    }

    fn id_iter(
        &self,
        limit: Option<usize>,
        cursor: Option<String>,
        reverse: bool,
        consistency: Consistency,
        batch_size: Option<usize>,
    ) -> KvdexResult<ListIter> {
        Ok(ListIter::new(
            Arc::clone(&self.backend),
            ListSelector::Prefix {
                prefix: self.keys.id.clone(),
            },
            limit,
            cursor,
            reverse,
            consistency,
            self.batch_size(batch_size),
        ))
    }

    // ========================================================================
    // Internal write plan
    // ========================================================================

    fn set_doc_value(
        &self,
        id: KeyPart,
        doc_value: KvValue,
        options: &WriteOptions,
        overwrite: bool,
    ) -> KvdexResult<WriteResult> {
        let id_key = self.id_key(&id);
        let mut attempts_left = options.retry;
        let mut cleared_existing = false;
        loop {
            let plan = self.plan_set(&id, &id_key, &doc_value)?;
            match self.backend.commit(plan)? {
                CommitResult::Committed { versionstamp } => {
                    return Ok(WriteResult::Committed { id, versionstamp })
                }
                CommitResult::Conflict => {
                    if overwrite {
                        // probe which invariant failed: id vacancy and
                        // index vacancy are independent checks
                        if self.is_indexable() && self.has_index_collision(&id, &doc_value)? {
                            debug!(id = %id, "write rejected by index collision");
                            return Ok(WriteResult::Conflict);
                        }
                        let id_taken = self
                            .backend
                            .get(&id_key, Consistency::Strong)?
                            .is_present();
                        if id_taken && !cleared_existing {
                            cleared_existing = true;
                            self.delete(std::slice::from_ref(&id))?;
                            continue;
                        }
                    }
                    if attempts_left == 0 {
                        return Ok(WriteResult::Conflict);
                    }
                    attempts_left -= 1;
                }
            }
        }
    }

    /// Build the single-atomic write plan for one document.
    fn plan_set(
        &self,
        id: &KeyPart,
        id_key: &KvKey,
        doc_value: &KvValue,
    ) -> KvdexResult<AtomicPayload> {
        let mut payload = AtomicPayload::default();
        payload.checks.push(Check {
            key: id_key.clone(),
            versionstamp: None,
        });

        let mut encoded_bytes = None;
        let stored_value = match &self.options.encoder {
            Some(encoder) => {
                let (bytes, is_bytes) = match doc_value {
                    KvValue::Bytes(b) => (encoder.pack(b.clone())?, true),
                    other => (encoder.encode(other)?, false),
                };
                let segment_base = self.keys.segment.extended(id.clone());
                let segment_ids =
                    push_segments(&mut payload, &segment_base, &bytes, self.limits.value_byte_limit);
                let sentinel = build_sentinel(&segment_ids, is_bytes);
                encoded_bytes = Some((bytes, is_bytes));
                sentinel
            }
            None => doc_value.clone(),
        };

        if self.options.history {
            let time_id = ids::time_id();
            let history_key = self.keys.history.extended(id.clone()).extended(time_id.clone());
            let history_value = match &encoded_bytes {
                Some((bytes, is_bytes)) => {
                    let base = self
                        .keys
                        .history_segment
                        .extended(id.clone())
                        .extended(time_id);
                    let segment_ids =
                        push_segments(&mut payload, &base, bytes, self.limits.value_byte_limit);
                    build_sentinel(&segment_ids, *is_bytes)
                }
                None => doc_value.clone(),
            };
            payload.mutations.push(Mutation::Set {
                key: history_key,
                value: history_write_entry(history_value),
                expire_in: None,
            });
        }

        payload.mutations.push(Mutation::Set {
            key: id_key.clone(),
            value: stored_value.clone(),
            expire_in: None,
        });

        for index in self.index_entries_for(id, doc_value, &stored_value)? {
            if index.kind == IndexKind::Primary {
                payload.checks.push(Check {
                    key: index.key.clone(),
                    versionstamp: None,
                });
            }
            payload.mutations.push(Mutation::Set {
                key: index.key,
                value: index.value,
                expire_in: None,
            });
        }
        Ok(payload)
    }

    pub(crate) fn index_entries_for(
        &self,
        id: &KeyPart,
        doc_value: &KvValue,
        stored_value: &KvValue,
    ) -> KvdexResult<Vec<IndexEntry>> {
        keys::index_entries(&self.keys, &self.options.indices, id, doc_value, stored_value)
    }

    /// True when a unique index entry for `doc_value` is already held by
    /// a different document.
    fn has_index_collision(&self, id: &KeyPart, doc_value: &KvValue) -> KvdexResult<bool> {
        for index in self.index_entries_for(id, doc_value, doc_value)? {
            if index.kind != IndexKind::Primary {
                continue;
            }
            let entry = self.backend.get(&index.key, Consistency::Strong)?;
            if let Some(existing) = entry.value {
                let owner = existing
                    .get(keys::ID_FIELD)
                    .map(keys::value_to_key_part)
                    .transpose()?;
                if owner.as_ref() != Some(id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn delete_docs(&self, ids: &[KeyPart], record_history: bool) -> KvdexResult<()> {
        let mut batch = BatchedAtomic::new(Arc::clone(&self.backend), Arc::clone(&self.limits));
        for id in ids {
            let id_key = self.id_key(id);
            let entry = self.backend.get(&id_key, Consistency::Strong)?;
            if let Some(stored) = entry.value {
                batch.delete(id_key);
                if self.is_encoded() {
                    if let Some((segment_ids, _)) = parse_sentinel(&stored) {
                        let base = self.keys.segment.extended(id.clone());
                        for segment_id in segment_ids {
                            batch.delete(base.extended(segment_id));
                        }
                    }
                }
                if self.is_indexable() {
                    let doc_value = self.resolve_stored(id, &stored)?;
                    for index in self.index_entries_for(id, &doc_value, &doc_value)? {
                        batch.delete(index.key);
                    }
                }
            }
            if record_history && self.options.history {
                let (key, value) = self.history_delete_entry(id);
                batch.set(key, value);
            }
        }
        batch.commit()?;
        Ok(())
    }

    pub(crate) fn history_delete_entry(&self, id: &KeyPart) -> (KvKey, KvValue) {
        let key = self.keys.history.extended(id.clone()).extended(ids::time_id());
        let mut map = BTreeMap::new();
        map.insert(
            HISTORY_TYPE_FIELD.to_string(),
            KvValue::String(HISTORY_TYPE_DELETE.to_string()),
        );
        map.insert(
            HISTORY_TIMESTAMP_FIELD.to_string(),
            KvValue::Timestamp(now_millis()),
        );
        (key, KvValue::Object(map))
    }

    // ========================================================================
    // Reconstruction
    // ========================================================================

    /// Rebuild a document from an entry whose key ends with the document
    /// id (id entries and secondary index entries).
    pub(crate) fn decode_entry(&self, entry: &Entry) -> KvdexResult<Option<Document<T>>> {
        let Some(stored) = entry.value.as_ref() else {
            return Ok(None);
        };
        let id = doc_id_from_key(&entry.key)?;
        let value = self.resolve_stored(&id, stored)?;
        Ok(Some(Document {
            versionstamp: entry
                .versionstamp
                .clone()
                .ok_or_else(|| KvdexError::corrupted("entry without versionstamp"))?,
            value: from_value(value)?,
            id,
        }))
    }

    /// Resolve a stored value into the document value, assembling
    /// segments for encoded collections.
    fn resolve_stored(&self, id: &KeyPart, stored: &KvValue) -> KvdexResult<KvValue> {
        let Some(_) = &self.options.encoder else {
            return Ok(stored.clone());
        };
        let (segment_ids, is_bytes) = parse_sentinel(stored).ok_or_else(|| {
            KvdexError::corrupted("encoded document entry is not a segment sentinel")
        })?;
        let base = self.keys.segment.extended(id.clone());
        self.assemble_segments(&base, &segment_ids, is_bytes)
    }

    /// Fetch and concatenate segments, then decompress and deserialize.
    fn assemble_segments(
        &self,
        base: &KvKey,
        segment_ids: &[usize],
        is_bytes: bool,
    ) -> KvdexResult<KvValue> {
        let encoder = self
            .options
            .encoder
            .as_ref()
            .ok_or_else(|| KvdexError::invalid_collection("collection declares no encoder"))?;
        let keys: Vec<KvKey> = segment_ids
            .iter()
            .map(|segment_id| base.extended(*segment_id))
            .collect();
        let mut bytes = Vec::new();
        for slice in keys.chunks(self.limits.get_many_key_limit) {
            for entry in self.backend.get_many(slice, Consistency::Strong)? {
                match entry.value {
                    Some(KvValue::Bytes(chunk)) => bytes.extend_from_slice(&chunk),
                    Some(other) => {
                        return Err(KvdexError::corrupted(format!(
                            "segment {} holds {}, expected bytes",
                            entry.key,
                            other.type_name()
                        )))
                    }
                    None => {
                        return Err(KvdexError::corrupted(format!(
                            "missing segment {}",
                            entry.key
                        )))
                    }
                }
            }
        }
        if is_bytes {
            Ok(KvValue::Bytes(encoder.unpack(&bytes)?))
        } else {
            encoder.decode(&bytes)
        }
    }

    fn primary_index_key(&self, field: &str, value: &KvValue) -> KvdexResult<KvKey> {
        Ok(self
            .keys
            .primary_index
            .extended(field)
            .extended(keys::encode_index_value(value)?))
    }

    fn secondary_index_prefix(&self, field: &str, value: &KvValue) -> KvdexResult<KvKey> {
        Ok(self
            .keys
            .secondary_index
            .extended(field)
            .extended(keys::encode_index_value(value)?))
    }
}

// ============================================================================
// Free helpers
// ============================================================================

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn doc_id_from_key(key: &KvKey) -> KvdexResult<KeyPart> {
    key.last()
        .cloned()
        .ok_or_else(|| KvdexError::corrupted("document entry with empty key"))
}

/// Chunk bytes into segment writes, returning the segment indexes.
fn push_segments(
    payload: &mut AtomicPayload,
    base: &KvKey,
    bytes: &[u8],
    chunk_size: usize,
) -> Vec<usize> {
    let mut segment_ids = Vec::new();
    for (index, chunk) in bytes.chunks(chunk_size.max(1)).enumerate() {
        payload.mutations.push(Mutation::Set {
            key: base.extended(index),
            value: KvValue::Bytes(chunk.to_vec()),
            expire_in: None,
        });
        segment_ids.push(index);
    }
    segment_ids
}

fn build_sentinel(segment_ids: &[usize], is_bytes: bool) -> KvValue {
    let mut map = BTreeMap::new();
    map.insert(
        SEGMENT_IDS_FIELD.to_string(),
        KvValue::Array(
            segment_ids
                .iter()
                .map(|segment_id| KvValue::Int(*segment_id as i64))
                .collect(),
        ),
    );
    map.insert(SEGMENT_IS_BYTES_FIELD.to_string(), KvValue::Bool(is_bytes));
    KvValue::Object(map)
}

/// Parse a segment sentinel. Extra fields (the primary-index
/// back-reference) are ignored.
fn parse_sentinel(value: &KvValue) -> Option<(Vec<usize>, bool)> {
    let map = value.as_object()?;
    let ids = match map.get(SEGMENT_IDS_FIELD)? {
        KvValue::Array(items) => items
            .iter()
            .map(|item| match item {
                KvValue::Int(n) if *n >= 0 => Some(*n as usize),
                _ => None,
            })
            .collect::<Option<Vec<usize>>>()?,
        _ => return None,
    };
    let is_bytes = matches!(map.get(SEGMENT_IS_BYTES_FIELD), Some(KvValue::Bool(true)));
    Some((ids, is_bytes))
}

pub(crate) fn history_write_entry(value: KvValue) -> KvValue {
    let mut map = BTreeMap::new();
    map.insert(
        HISTORY_TYPE_FIELD.to_string(),
        KvValue::String(HISTORY_TYPE_WRITE.to_string()),
    );
    map.insert(
        HISTORY_TIMESTAMP_FIELD.to_string(),
        KvValue::Timestamp(now_millis()),
    );
    map.insert(HISTORY_VALUE_FIELD.to_string(), value);
    KvValue::Object(map)
}

/// Split a primary index entry into the document id and the stored value.
fn split_primary_entry(stored: &KvValue) -> KvdexResult<(KeyPart, KvValue)> {
    let map = stored
        .as_object()
        .ok_or_else(|| KvdexError::corrupted("malformed primary index entry"))?;
    let id_value = map
        .get(keys::ID_FIELD)
        .ok_or_else(|| KvdexError::corrupted("primary index entry without back-reference"))?;
    let id = keys::value_to_key_part(id_value)?;
    let mut value = map.clone();
    value.remove(keys::ID_FIELD);
    Ok((id, KvValue::Object(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_round_trip() {
        let sentinel = build_sentinel(&[0, 1, 2], true);
        let (ids, is_bytes) = parse_sentinel(&sentinel).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(is_bytes);
    }

    #[test]
    fn test_sentinel_ignores_extra_fields() {
        let mut sentinel = build_sentinel(&[0], false);
        sentinel
            .as_object_mut()
            .unwrap()
            .insert(keys::ID_FIELD.to_string(), KvValue::String("d1".into()));
        assert!(parse_sentinel(&sentinel).is_some());
    }

    #[test]
    fn test_sentinel_rejects_non_sentinels() {
        assert!(parse_sentinel(&KvValue::Int(1)).is_none());
        assert!(parse_sentinel(&KvValue::Object(Default::default())).is_none());
    }

    #[test]
    fn test_split_primary_entry() {
        let mut map = BTreeMap::new();
        map.insert("age".to_string(), KvValue::Int(20));
        map.insert(keys::ID_FIELD.to_string(), KvValue::String("d1".into()));
        let (id, value) = split_primary_entry(&KvValue::Object(map)).unwrap();
        assert_eq!(id, KeyPart::String("d1".into()));
        assert!(value.get(keys::ID_FIELD).is_none());
        assert_eq!(value.get("age"), Some(&KvValue::Int(20)));
    }

    #[test]
    fn test_push_segments_chunks_at_limit() {
        let mut payload = AtomicPayload::default();
        let base = kvdex_core::kv_key!["__kvdex__", "c", "__segment__", "d"];
        let ids = push_segments(&mut payload, &base, &[0u8; 100], 32);
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(payload.mutations.len(), 4);
    }
}
