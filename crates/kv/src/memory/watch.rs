//! Watch hub: per-key subscriber lists for the in-memory backend.

use crate::backend::Entry;
use kvdex_core::KvKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};

struct Sub {
    keys: Vec<KvKey>,
    tx: Sender<Vec<Entry>>,
}

/// Registry of active watchers.
#[derive(Default)]
pub(crate) struct WatchHub {
    subs: Mutex<HashMap<u64, Sub>>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        WatchHub::default()
    }

    /// Register a watcher over `keys`. The caller sends the initial
    /// snapshot itself, through the returned sender.
    pub(crate) fn subscribe(
        &self,
        keys: Vec<KvKey>,
    ) -> (u64, Sender<Vec<Entry>>, Receiver<Vec<Entry>>) {
        let (tx, rx) = channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().insert(
            id,
            Sub {
                keys,
                tx: tx.clone(),
            },
        );
        (id, tx, rx)
    }

    pub(crate) fn unsubscribe(&self, id: u64) {
        self.subs.lock().remove(&id);
    }

    /// Push a fresh snapshot to every watcher whose key set intersects
    /// `touched`. `read` resolves a key set to entries in key order.
    pub(crate) fn notify(
        &self,
        touched: &HashSet<KvKey>,
        read: impl Fn(&[KvKey]) -> Vec<Entry>,
    ) {
        let affected: Vec<(u64, Vec<KvKey>, Sender<Vec<Entry>>)> = self
            .subs
            .lock()
            .iter()
            .filter(|(_, sub)| sub.keys.iter().any(|k| touched.contains(k)))
            .map(|(id, sub)| (*id, sub.keys.clone(), sub.tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, keys, tx) in affected {
            let snapshot = read(&keys);
            if tx.send(snapshot).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subs.lock();
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    /// Drop every subscriber, closing all streams.
    pub(crate) fn close(&self) {
        self.subs.lock().clear();
    }
}
