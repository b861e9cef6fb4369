//! Database facade
//!
//! `KvDex` owns the backend handle, the queue-handler registry, and the
//! schema tree: a registry of typed collections materialized by the
//! builder. Collections themselves are stateless facades, so the
//! registry hands out clones.

use crate::atomic::AtomicBuilder;
use crate::batch::BatchedAtomic;
use crate::collection::options::{CollectionOptions, EnqueueOptions, ListOptions};
use crate::collection::Collection;
use crate::envelope::{self, QueueRegistry};
use crate::keys::{root_key, UNDELIVERED_KEY_PREFIX};
use crate::scheduler::{self, Interval, SchedulerHandle, SchedulerMessage, SchedulerOptions};
use kvdex_core::{
    from_value, to_value, CommitResult, Document, KeyPart, KvKey, KvLimits, KvdexError,
    KvdexResult,
};
use kvdex_kv::{Backend, Consistency, ListIter, ListSelector};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Type-erased bulk operations over one registered collection.
trait CollectionOps: Send + Sync {
    fn count_all(&self) -> KvdexResult<usize>;
    fn delete_all(&self) -> KvdexResult<()>;
}

impl<T> CollectionOps for Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn count_all(&self) -> KvdexResult<usize> {
        self.count(&ListOptions::default())
    }

    fn delete_all(&self) -> KvdexResult<()> {
        self.delete_many(&ListOptions::default())?;
        Ok(())
    }
}

struct Registered {
    any: Box<dyn Any + Send + Sync>,
    ops: Arc<dyn CollectionOps>,
}

type PendingCollection =
    Box<dyn FnOnce(&Arc<dyn Backend>, &Arc<KvLimits>, &Arc<QueueRegistry>) -> KvdexResult<(KvKey, Registered)>>;

/// Builder composing the schema tree over a backend.
pub struct KvDexBuilder {
    backend: Arc<dyn Backend>,
    limits: KvLimits,
    pending: Vec<PendingCollection>,
}

impl KvDexBuilder {
    /// Start a builder over a backend with default limits.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        KvDexBuilder {
            backend,
            limits: KvLimits::default(),
            pending: Vec::new(),
        }
    }

    /// Override the operational limits.
    pub fn limits(mut self, limits: KvLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Declare a collection at `path`. Nested paths form branches of the
    /// schema tree.
    pub fn collection<T>(mut self, path: KvKey, options: CollectionOptions) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.pending.push(Box::new(move |backend, limits, queue| {
            let collection = Collection::<T>::new(
                Arc::clone(backend),
                Arc::clone(limits),
                Arc::clone(queue),
                &path,
                options,
            )?;
            Ok((
                path,
                Registered {
                    ops: Arc::new(collection.clone()),
                    any: Box::new(collection),
                },
            ))
        }));
        self
    }

    /// Materialize the schema tree.
    pub fn build(self) -> KvdexResult<KvDex> {
        let backend = self.backend;
        let limits = Arc::new(self.limits);
        let queue = Arc::new(QueueRegistry::new());
        let mut collections = HashMap::new();
        for pending in self.pending {
            let (path, registered) = pending(&backend, &limits, &queue)?;
            if collections.insert(path.clone(), registered).is_some() {
                return Err(KvdexError::invalid_collection(format!(
                    "duplicate collection path {}",
                    path
                )));
            }
        }
        info!(collections = collections.len(), "database facade ready");
        Ok(KvDex {
            inner: Arc::new(DbInner {
                backend,
                limits,
                queue,
                collections,
            }),
        })
    }
}

struct DbInner {
    backend: Arc<dyn Backend>,
    limits: Arc<KvLimits>,
    queue: Arc<QueueRegistry>,
    collections: HashMap<KvKey, Registered>,
}

/// The database facade: schema tree, global queue, schedulers, and
/// store-wide bulk operations.
#[derive(Clone)]
pub struct KvDex {
    inner: Arc<DbInner>,
}

impl KvDex {
    /// Start composing a database over a backend.
    pub fn builder(backend: Arc<dyn Backend>) -> KvDexBuilder {
        KvDexBuilder::new(backend)
    }

    /// The underlying backend handle.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// The operational limits.
    pub fn limits(&self) -> &Arc<KvLimits> {
        &self.inner.limits
    }

    /// Fetch a registered collection by path.
    pub fn collection<T>(&self, path: &KvKey) -> KvdexResult<Collection<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let registered = self.inner.collections.get(path).ok_or_else(|| {
            KvdexError::invalid_collection(format!("unknown collection path {}", path))
        })?;
        registered
            .any
            .downcast_ref::<Collection<T>>()
            .cloned()
            .ok_or_else(|| {
                KvdexError::invalid_collection(format!(
                    "collection {} is registered under a different document type",
                    path
                ))
            })
    }

    /// Start an atomic builder in the context of the collection at
    /// `path`.
    pub fn atomic<T>(&self, path: &KvKey) -> KvdexResult<AtomicBuilder<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        AtomicBuilder::new(&self.collection(path)?)
    }

    // ========================================================================
    // Global queue
    // ========================================================================

    /// Enqueue data for database-level listeners.
    pub fn enqueue<D: Serialize>(
        &self,
        data: &D,
        options: &EnqueueOptions,
    ) -> KvdexResult<CommitResult> {
        let handler_id = envelope::handler_id(&root_key(), options.topic.as_deref());
        let message = envelope::wrap(to_value(data)?, handler_id);
        let keys_if_undelivered = options
            .ids_if_undelivered
            .iter()
            .map(|id| self.undelivered_key(id))
            .collect();
        self.inner.backend.enqueue(
            message,
            kvdex_kv::EnqueueOptions {
                delay: options.delay,
                keys_if_undelivered,
                backoff_schedule: options.backoff_schedule.clone(),
            },
        )
    }

    /// Register a database-level listener. The first listener anywhere
    /// activates the single dispatcher.
    pub fn listen_queue<M, F>(&self, handler: F, topic: Option<&str>) -> KvdexResult<()>
    where
        M: DeserializeOwned,
        F: Fn(M) -> KvdexResult<()> + Send + Sync + 'static,
    {
        let handler_id = envelope::handler_id(&root_key(), topic);
        self.inner.queue.register(
            handler_id,
            Arc::new(move |value| handler(from_value(value)?)),
        );
        QueueRegistry::activate(&self.inner.queue, &self.inner.backend)
    }

    /// Read a database-level undelivered capture.
    pub fn find_undelivered<M: DeserializeOwned>(
        &self,
        id: &KeyPart,
    ) -> KvdexResult<Option<Document<M>>> {
        let key = self.undelivered_key(id);
        let entry = self.inner.backend.get(&key, Consistency::Strong)?;
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

    /// Delete a database-level undelivered capture.
    pub fn delete_undelivered(&self, id: &KeyPart) -> KvdexResult<()> {
        self.inner.backend.delete(&self.undelivered_key(id))
    }

    fn undelivered_key(&self, id: &KeyPart) -> KvKey {
        root_key()
            .extended(UNDELIVERED_KEY_PREFIX)
            .extended(id.clone())
    }

    // ========================================================================
    // Schedulers
    // ========================================================================

    /// Invoke `tick` every `interval`, driven by queue delivery. Runs
    /// until a termination predicate fires.
    pub fn set_interval<F>(
        &self,
        interval: Duration,
        options: SchedulerOptions,
        tick: F,
    ) -> KvdexResult<SchedulerHandle>
    where
        F: Fn(&SchedulerMessage) + Send + Sync + 'static,
    {
        scheduler::start_scheduler(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.limits),
            &self.inner.queue,
            Interval::Fixed(interval),
            self.inner.limits.min_interval_start_delay,
            options,
            tick,
        )
    }

    /// Invoke `tick` in a queue-driven loop with an optional delay
    /// between iterations.
    pub fn spawn_loop<F>(
        &self,
        delay: Option<Duration>,
        options: SchedulerOptions,
        tick: F,
    ) -> KvdexResult<SchedulerHandle>
    where
        F: Fn(&SchedulerMessage) + Send + Sync + 'static,
    {
        scheduler::start_scheduler(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.limits),
            &self.inner.queue,
            Interval::Fixed(delay.unwrap_or(Duration::ZERO)),
            self.inner.limits.min_loop_start_delay,
            options,
            tick,
        )
    }

    /// Interval variant whose delay derives from the last tick message.
    pub fn set_dynamic_interval<F>(
        &self,
        interval: Arc<dyn Fn(&SchedulerMessage) -> Duration + Send + Sync>,
        options: SchedulerOptions,
        tick: F,
    ) -> KvdexResult<SchedulerHandle>
    where
        F: Fn(&SchedulerMessage) + Send + Sync + 'static,
    {
        scheduler::start_scheduler(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.limits),
            &self.inner.queue,
            Interval::Dynamic(interval),
            self.inner.limits.min_interval_start_delay,
            options,
            tick,
        )
    }

    // ========================================================================
    // Store-wide operations
    // ========================================================================

    /// Sum of document counts across every registered collection.
    pub fn count_all(&self) -> KvdexResult<usize> {
        let mut total = 0;
        for registered in self.inner.collections.values() {
            total += registered.ops.count_all()?;
        }
        Ok(total)
    }

    /// Delete every document in every registered collection.
    pub fn delete_all(&self) -> KvdexResult<()> {
        for registered in self.inner.collections.values() {
            registered.ops.delete_all()?;
        }
        Ok(())
    }

    /// Delete every engine-managed key: documents, segments, indices,
    /// history, and undelivered captures.
    pub fn wipe(&self) -> KvdexResult<()> {
        let iter = ListIter::new(
            Arc::clone(&self.inner.backend),
            ListSelector::Prefix { prefix: root_key() },
            None,
            None,
            false,
            Consistency::Strong,
            500,
        );
        let mut batch = BatchedAtomic::new(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.limits),
        );
        for entry in iter {
            batch.delete(entry?.key);
        }
        batch.commit()?;
        info!("store wiped");
        Ok(())
    }

    /// Close the underlying backend.
    pub fn close(&self) {
        self.inner.backend.close();
    }
}
