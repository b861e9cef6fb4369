//! In-memory reference backend
//!
//! Backs the full KV contract with an ordered map guarded by a mutex.
//! Versionstamps come from a monotonic counter. A queue worker thread
//! drives delivery with per-message delay and backoff; a TTL sweeper
//! deletes expired keys at their deadline. Watchers receive a fresh
//! snapshot on every commit that touches one of their keys.

mod queue;
mod store;
mod watch;

use crate::atomic::{AtomicPayload, Mutation};
use crate::backend::{Backend, Consistency, EnqueueOptions, Entry, QueueHandler, SetOptions};
use crate::selector::{ListPage, ListSelector, PageRequest};
use crate::watch::WatchStream;
use kvdex_core::{CommitResult, KvKey, KvLimits, KvValue, KvdexError, KvdexResult};
use queue::{Broker, QueueMessage};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use store::{Store, Stored};
use tracing::{debug, warn};
use watch::WatchHub;

struct Shared {
    store: Store,
    queue: Broker,
    watch: WatchHub,
    limits: KvLimits,
    closed: AtomicBool,
}

/// Map-backed implementation of the KV contract.
pub struct MemoryKv {
    shared: Arc<Shared>,
}

impl MemoryKv {
    /// Open a backend with default limits.
    pub fn new() -> Self {
        Self::with_limits(KvLimits::default())
    }

    /// Open a backend with custom limits.
    pub fn with_limits(limits: KvLimits) -> Self {
        let shared = Arc::new(Shared {
            store: Store::new(),
            queue: Broker::new(limits.queue_backoff_schedule.clone()),
            watch: WatchHub::new(),
            limits,
            closed: AtomicBool::new(false),
        });

        let queue_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("kvdex-queue".to_string())
            .spawn(move || queue_worker(queue_shared))
            .expect("failed to spawn queue worker thread");

        let ttl_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("kvdex-ttl".to_string())
            .spawn(move || ttl_worker(ttl_shared))
            .expect("failed to spawn ttl sweeper thread");

        MemoryKv { shared }
    }

    fn ensure_open(&self) -> KvdexResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(KvdexError::storage("backend is closed"));
        }
        Ok(())
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        MemoryKv::new()
    }
}

impl Drop for MemoryKv {
    fn drop(&mut self) {
        self.close();
    }
}

impl Backend for MemoryKv {
    fn get(&self, key: &KvKey, _consistency: Consistency) -> KvdexResult<Entry> {
        self.ensure_open()?;
        Ok(self.shared.store.read(key))
    }

    fn get_many(&self, keys: &[KvKey], _consistency: Consistency) -> KvdexResult<Vec<Entry>> {
        self.ensure_open()?;
        if keys.len() > self.shared.limits.get_many_key_limit {
            return Err(KvdexError::invalid_input(format!(
                "get_many accepts at most {} keys per call, got {}",
                self.shared.limits.get_many_key_limit,
                keys.len()
            )));
        }
        Ok(self.shared.store.read_many(keys))
    }

    fn set(&self, key: &KvKey, value: KvValue, options: SetOptions) -> KvdexResult<CommitResult> {
        self.ensure_open()?;
        commit_payload(
            &self.shared,
            AtomicPayload {
                checks: Vec::new(),
                mutations: vec![Mutation::Set {
                    key: key.clone(),
                    value,
                    expire_in: options.expire_in,
                }],
            },
        )
    }

    fn delete(&self, key: &KvKey) -> KvdexResult<()> {
        self.ensure_open()?;
        commit_payload(
            &self.shared,
            AtomicPayload {
                checks: Vec::new(),
                mutations: vec![Mutation::Delete { key: key.clone() }],
            },
        )?;
        Ok(())
    }

    fn list_page(&self, selector: &ListSelector, request: &PageRequest) -> KvdexResult<ListPage> {
        self.ensure_open()?;
        self.shared.store.list_page(selector, request)
    }

    fn commit(&self, payload: AtomicPayload) -> KvdexResult<CommitResult> {
        self.ensure_open()?;
        commit_payload(&self.shared, payload)
    }

    fn enqueue(&self, value: KvValue, options: EnqueueOptions) -> KvdexResult<CommitResult> {
        self.ensure_open()?;
        commit_payload(
            &self.shared,
            AtomicPayload {
                checks: Vec::new(),
                mutations: vec![Mutation::Enqueue { value, options }],
            },
        )
    }

    fn listen_queue(&self, handler: QueueHandler) -> KvdexResult<()> {
        self.ensure_open()?;
        self.shared.queue.register(handler);
        Ok(())
    }

    fn watch(&self, keys: Vec<KvKey>) -> KvdexResult<WatchStream> {
        self.ensure_open()?;
        let (id, tx, rx) = self.shared.watch.subscribe(keys.clone());
        // initial snapshot so a watcher always observes current state
        let _ = tx.send(self.shared.store.read_many(&keys));
        let shared = Arc::clone(&self.shared);
        Ok(WatchStream::new(
            rx,
            Box::new(move || shared.watch.unsubscribe(id)),
        ))
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.shutdown();
        self.shared.store.ttl_cv.notify_all();
        self.shared.watch.close();
    }
}

/// Evaluate and apply one atomic payload.
///
/// Checks are evaluated and mutations staged under the map lock; the map
/// is only touched once every mutation has validated, so a failed payload
/// leaves no partial state. All entries written by one commit share one
/// versionstamp.
fn commit_payload(shared: &Shared, payload: AtomicPayload) -> KvdexResult<CommitResult> {
    let limits = &shared.limits;
    if payload.mutations.len() > limits.atomic_mutation_limit {
        return Err(KvdexError::invalid_input(format!(
            "atomic operation exceeds {} mutations",
            limits.atomic_mutation_limit
        )));
    }
    if payload.checks.len() > limits.atomic_check_limit {
        return Err(KvdexError::invalid_input(format!(
            "atomic operation exceeds {} checks",
            limits.atomic_check_limit
        )));
    }
    let key_bytes: usize = payload
        .mutations
        .iter()
        .filter_map(Mutation::key)
        .chain(payload.checks.iter().map(|c| &c.key))
        .map(KvKey::byte_size)
        .sum();
    if key_bytes > limits.atomic_key_size_limit {
        return Err(KvdexError::invalid_input(format!(
            "atomic operation exceeds {} key bytes",
            limits.atomic_key_size_limit
        )));
    }

    let now = Instant::now();
    let mut enqueues = Vec::new();
    let versionstamp;
    let mut touched = HashSet::new();
    {
        let mut map = shared.store.lock_map();

        for check in &payload.checks {
            let current = map.get(&check.key).and_then(|stored| {
                if stored
                    .expires_at
                    .is_some_and(|deadline| deadline <= now)
                {
                    None
                } else {
                    Some(stored.versionstamp.clone())
                }
            });
            if current != check.versionstamp {
                debug!(key = %check.key, "atomic check failed");
                return Ok(CommitResult::Conflict);
            }
        }

        // Stage every mutation before touching the map, so a bad numeric
        // operand aborts with nothing applied.
        let mut overlay: HashMap<KvKey, Option<(KvValue, Option<Instant>)>> = HashMap::new();
        for mutation in &payload.mutations {
            match mutation {
                Mutation::Set {
                    key,
                    value,
                    expire_in,
                } => {
                    overlay.insert(
                        key.clone(),
                        Some((value.clone(), expire_in.map(|d| now + d))),
                    );
                }
                Mutation::Delete { key } => {
                    overlay.insert(key.clone(), None);
                }
                Mutation::Sum { key, value }
                | Mutation::Min { key, value }
                | Mutation::Max { key, value } => {
                    let current = match overlay.get(key) {
                        Some(Some((v, _))) => Some(v.clone()),
                        Some(None) => None,
                        None => map.get(key).map(|stored| stored.value.clone()),
                    };
                    let current = match current {
                        None => 0,
                        Some(KvValue::U64(n)) => n,
                        Some(other) => {
                            return Err(KvdexError::invalid_input(format!(
                                "numeric mutation target holds {}, expected a u64",
                                other.type_name()
                            )))
                        }
                    };
                    let next = match mutation {
                        Mutation::Sum { .. } => current.wrapping_add(*value),
                        Mutation::Min { .. } => current.min(*value),
                        Mutation::Max { .. } => current.max(*value),
                        _ => unreachable!(),
                    };
                    overlay.insert(key.clone(), Some((KvValue::U64(next), None)));
                }
                Mutation::Enqueue { value, options } => {
                    enqueues.push((value.clone(), options.clone()));
                }
            }
        }

        versionstamp = shared.store.next_versionstamp();
        let mut ttl_adds = Vec::new();
        for (key, staged) in overlay {
            touched.insert(key.clone());
            match staged {
                Some((value, expires_at)) => {
                    map.insert(
                        key.clone(),
                        Stored {
                            value,
                            versionstamp: versionstamp.clone(),
                            expires_at,
                        },
                    );
                    if let Some(deadline) = expires_at {
                        ttl_adds.push((key, deadline));
                    }
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        drop(map);
        for (key, deadline) in ttl_adds {
            shared.store.track_expiry(key, deadline);
        }
    }

    if !touched.is_empty() {
        shared
            .watch
            .notify(&touched, |keys| shared.store.read_many(keys));
    }
    for (value, options) in enqueues {
        shared.queue.submit(
            value,
            options.delay,
            options.keys_if_undelivered,
            options.backoff_schedule,
        );
    }

    Ok(CommitResult::Committed { versionstamp })
}

/// Delivery loop: pop due messages, invoke the dispatcher, reschedule on
/// failure, capture undelivered values once the backoff is exhausted.
fn queue_worker(shared: Arc<Shared>) {
    loop {
        let mut state = shared.queue.state.lock();
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let has_handler = state.handler.is_some();
        let next_at = state.heap.peek().map(|Reverse(s)| s.deliver_at);
        match (has_handler, next_at) {
            (true, Some(at)) if at <= now => {
                let handler = state.handler.clone().expect("handler present");
                let Reverse(sched) = state.heap.pop().expect("message present");
                drop(state);
                deliver(&shared, handler, sched.msg);
            }
            (true, Some(at)) => {
                shared.queue.cv.wait_until(&mut state, at);
            }
            _ => {
                shared.queue.cv.wait(&mut state);
            }
        }
    }
}

fn deliver(shared: &Arc<Shared>, handler: QueueHandler, msg: QueueMessage) {
    if let Err(err) = handler(msg.value.clone()) {
        debug!(error = %err, attempt = msg.attempt, "queue delivery failed");
        let QueueMessage {
            value,
            attempt,
            backoff,
            keys_if_undelivered,
        } = msg;
        if attempt < backoff.len() {
            let wait = Duration::from_millis(backoff[attempt]);
            shared.queue.schedule(
                QueueMessage {
                    value,
                    attempt: attempt + 1,
                    backoff,
                    keys_if_undelivered,
                },
                Instant::now() + wait,
            );
        } else {
            warn!(
                keys = keys_if_undelivered.len(),
                "delivery attempts exhausted, capturing undelivered message"
            );
            for key in &keys_if_undelivered {
                let result = commit_payload(
                    shared,
                    AtomicPayload {
                        checks: Vec::new(),
                        mutations: vec![Mutation::Set {
                            key: key.clone(),
                            value: value.clone(),
                            expire_in: None,
                        }],
                    },
                );
                if let Err(err) = result {
                    warn!(error = %err, key = %key, "failed to capture undelivered message");
                }
            }
        }
    }
}

/// Deadline sweep: delete each expired key at its deadline and notify
/// watchers.
fn ttl_worker(shared: Arc<Shared>) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        let mut heap = shared.store.ttl.lock();
        let now = Instant::now();
        let next = heap.peek().map(|Reverse((deadline, _))| *deadline);
        match next {
            None => {
                shared.store.ttl_cv.wait(&mut heap);
            }
            Some(deadline) if deadline <= now => {
                let Reverse((_, key)) = heap.pop().expect("deadline present");
                drop(heap);
                if shared.store.expire(&key) {
                    let mut touched = HashSet::new();
                    touched.insert(key);
                    shared
                        .watch
                        .notify(&touched, |keys| shared.store.read_many(keys));
                }
            }
            Some(deadline) => {
                shared.store.ttl_cv.wait_until(&mut heap, deadline);
            }
        }
    }
}
