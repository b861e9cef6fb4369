//! Ordered map storage for the in-memory backend
//!
//! Keys sort by their tuple order (`KvKey` is `Ord`), so a `BTreeMap` is
//! already in canonical store order and range listing is a bounded scan.
//! TTLs are tracked in a deadline heap serviced by a sweeper thread;
//! reads also check expiry lazily so a late sweeper never leaks a value.

use crate::backend::Entry;
use crate::selector::{decode_cursor, encode_cursor, ListPage, ListSelector, PageRequest};
use kvdex_core::{KvKey, KvValue, KvdexResult, Versionstamp};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone)]
pub(crate) struct Stored {
    pub(crate) value: KvValue,
    pub(crate) versionstamp: Versionstamp,
    pub(crate) expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Ordered map plus versionstamp clock and TTL bookkeeping.
pub(crate) struct Store {
    map: Mutex<BTreeMap<KvKey, Stored>>,
    clock: AtomicU64,
    pub(crate) ttl: Mutex<BinaryHeap<Reverse<(Instant, KvKey)>>>,
    pub(crate) ttl_cv: Condvar,
}

impl Store {
    pub(crate) fn new() -> Self {
        Store {
            map: Mutex::new(BTreeMap::new()),
            clock: AtomicU64::new(0),
            ttl: Mutex::new(BinaryHeap::new()),
            ttl_cv: Condvar::new(),
        }
    }

    /// Mint the next versionstamp.
    pub(crate) fn next_versionstamp(&self) -> Versionstamp {
        Versionstamp::from_counter(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn lock_map(&self) -> parking_lot::MutexGuard<'_, BTreeMap<KvKey, Stored>> {
        self.map.lock()
    }

    /// Read one entry, treating expired values as missing.
    pub(crate) fn read(&self, key: &KvKey) -> Entry {
        let now = Instant::now();
        let mut map = self.map.lock();
        match map.get(key) {
            Some(stored) if !stored.is_expired(now) => Entry {
                key: key.clone(),
                value: Some(stored.value.clone()),
                versionstamp: Some(stored.versionstamp.clone()),
            },
            Some(_) => {
                map.remove(key);
                Entry::missing(key.clone())
            }
            None => Entry::missing(key.clone()),
        }
    }

    /// Read several entries in key-list order.
    pub(crate) fn read_many(&self, keys: &[KvKey]) -> Vec<Entry> {
        keys.iter().map(|key| self.read(key)).collect()
    }

    /// Schedule a TTL deadline for the sweeper.
    pub(crate) fn track_expiry(&self, key: KvKey, deadline: Instant) {
        self.ttl.lock().push(Reverse((deadline, key)));
        self.ttl_cv.notify_one();
    }

    /// Remove `key` if its stored TTL has passed. Returns true on removal.
    pub(crate) fn expire(&self, key: &KvKey) -> bool {
        let now = Instant::now();
        let mut map = self.map.lock();
        match map.get(key) {
            Some(stored) if stored.is_expired(now) => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Serve one page of a range listing.
    pub(crate) fn list_page(
        &self,
        selector: &ListSelector,
        request: &PageRequest,
    ) -> KvdexResult<ListPage> {
        let after = request.cursor.as_deref().map(decode_cursor).transpose()?;
        let now = Instant::now();
        let map = self.map.lock();

        let lower = match selector {
            ListSelector::Prefix { prefix } | ListSelector::PrefixEnd { prefix, .. } => prefix,
            ListSelector::PrefixStart { prefix, start } => start.max(prefix),
            ListSelector::Range { start, .. } => start,
        };

        let mut matched: Vec<Entry> = map
            .range((Bound::Included(lower.clone()), Bound::Unbounded))
            .take_while(|(key, _)| match selector {
                ListSelector::Prefix { prefix } | ListSelector::PrefixStart { prefix, .. } => {
                    key.starts_with(prefix)
                }
                ListSelector::PrefixEnd { prefix, end } => key.starts_with(prefix) && *key < end,
                ListSelector::Range { end, .. } => *key < end,
            })
            .filter(|(key, stored)| selector.contains(key) && !stored.is_expired(now))
            .map(|(key, stored)| Entry {
                key: key.clone(),
                value: Some(stored.value.clone()),
                versionstamp: Some(stored.versionstamp.clone()),
            })
            .collect();
        drop(map);

        if request.reverse {
            matched.reverse();
        }

        if let Some(after) = after {
            let forward = !request.reverse;
            matched.retain(|entry| {
                if forward {
                    entry.key > after
                } else {
                    entry.key < after
                }
            });
        }

        let more = matched.len() > request.page_size;
        matched.truncate(request.page_size);
        let cursor = if more {
            matched.last().map(|entry| encode_cursor(&entry.key))
        } else {
            None
        };

        Ok(ListPage {
            entries: matched,
            cursor,
        })
    }
}
