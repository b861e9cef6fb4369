//! Range selectors, cursors, and lazy listing
//!
//! A list selector names a contiguous key range: a prefix, a prefix with
//! one bound, or two explicit bounds. When both bounds are present the
//! prefix is dropped, since the bounds fully define the range. Cursors are
//! opaque resumable positions (base64 of the last key consumed).

use crate::backend::{Backend, Consistency, Entry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kvdex_core::{KvKey, KvdexError, KvdexResult};
use std::collections::VecDeque;
use std::sync::Arc;

/// A contiguous key range. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum ListSelector {
    /// Every key strictly below `prefix`.
    Prefix {
        /// Common ancestor of every selected key.
        prefix: KvKey,
    },
    /// Keys below `prefix`, starting at `start`.
    PrefixStart {
        /// Common ancestor of every selected key.
        prefix: KvKey,
        /// Inclusive lower bound.
        start: KvKey,
    },
    /// Keys below `prefix`, up to `end`.
    PrefixEnd {
        /// Common ancestor of every selected key.
        prefix: KvKey,
        /// Exclusive upper bound.
        end: KvKey,
    },
    /// Explicit range.
    Range {
        /// Inclusive lower bound.
        start: KvKey,
        /// Exclusive upper bound.
        end: KvKey,
    },
}

impl ListSelector {
    /// Assemble a selector from an optional prefix and optional bounds.
    ///
    /// When both bounds are present the prefix is intentionally dropped.
    /// A single bound without a prefix is rejected.
    pub fn build(
        prefix: Option<KvKey>,
        start: Option<KvKey>,
        end: Option<KvKey>,
    ) -> KvdexResult<ListSelector> {
        match (prefix, start, end) {
            (_, Some(start), Some(end)) => Ok(ListSelector::Range { start, end }),
            (Some(prefix), Some(start), None) => Ok(ListSelector::PrefixStart { prefix, start }),
            (Some(prefix), None, Some(end)) => Ok(ListSelector::PrefixEnd { prefix, end }),
            (Some(prefix), None, None) => Ok(ListSelector::Prefix { prefix }),
            _ => Err(KvdexError::invalid_input(
                "list selector needs a prefix or both bounds",
            )),
        }
    }

    /// True when `key` falls inside the selected range.
    pub fn contains(&self, key: &KvKey) -> bool {
        match self {
            ListSelector::Prefix { prefix } => key.starts_with(prefix) && key.len() > prefix.len(),
            ListSelector::PrefixStart { prefix, start } => {
                key.starts_with(prefix) && key.len() > prefix.len() && key >= start
            }
            ListSelector::PrefixEnd { prefix, end } => {
                key.starts_with(prefix) && key.len() > prefix.len() && key < end
            }
            ListSelector::Range { start, end } => key >= start && key < end,
        }
    }
}

/// One page worth of listing parameters.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Resume after this cursor.
    pub cursor: Option<String>,
    /// Maximum entries in the page.
    pub page_size: usize,
    /// Walk the range in descending key order.
    pub reverse: bool,
    /// Read consistency.
    pub consistency: Consistency,
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            cursor: None,
            page_size: 500,
            reverse: false,
            consistency: Consistency::Strong,
        }
    }
}

/// One page of results plus the cursor to resume after it. `cursor` is
/// `None` when the range is exhausted.
#[derive(Debug, Clone)]
pub struct ListPage {
    /// Entries in traversal order.
    pub entries: Vec<Entry>,
    /// Position after the last entry, when more remain.
    pub cursor: Option<String>,
}

/// Encode a resumable cursor for the given key.
pub fn encode_cursor(key: &KvKey) -> String {
    // serialization of a key cannot fail
    let json = serde_json::to_vec(key).expect("key serialization");
    BASE64.encode(json)
}

/// Decode a cursor produced by [`encode_cursor`].
pub fn decode_cursor(cursor: &str) -> KvdexResult<KvKey> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|e| KvdexError::invalid_input(format!("malformed cursor: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| KvdexError::invalid_input(format!("malformed cursor: {}", e)))
}

/// Lazy iterator over a selector, fetching pages on demand.
///
/// `limit` caps the number of entries consumed from the store. The final
/// cursor is available through [`ListIter::cursor`] after the iterator is
/// drained (or abandoned mid-range).
pub struct ListIter {
    backend: Arc<dyn Backend>,
    selector: ListSelector,
    batch_size: usize,
    reverse: bool,
    consistency: Consistency,
    remaining: Option<usize>,
    cursor: Option<String>,
    buffer: VecDeque<Entry>,
    exhausted: bool,
}

impl ListIter {
    /// Open a lazy listing.
    pub fn new(
        backend: Arc<dyn Backend>,
        selector: ListSelector,
        limit: Option<usize>,
        cursor: Option<String>,
        reverse: bool,
        consistency: Consistency,
        batch_size: usize,
    ) -> Self {
        ListIter {
            backend,
            selector,
            batch_size: batch_size.max(1),
            reverse,
            consistency,
            remaining: limit,
            cursor,
            buffer: VecDeque::new(),
            exhausted: limit == Some(0),
        }
    }

    /// The cursor after the last consumed entry, `None` once the range is
    /// exhausted.
    pub fn cursor(&self) -> Option<String> {
        if self.exhausted && self.buffer.is_empty() {
            // a limit hit mid-range still resumes from the cursor
            if self.remaining == Some(0) {
                return self.cursor.clone();
            }
            return None;
        }
        self.cursor.clone()
    }

    fn fetch(&mut self) -> KvdexResult<()> {
        let page_size = match self.remaining {
            Some(n) => n.min(self.batch_size),
            None => self.batch_size,
        };
        let page = self.backend.list_page(
            &self.selector,
            &PageRequest {
                cursor: self.cursor.clone(),
                page_size,
                reverse: self.reverse,
                consistency: self.consistency,
            },
        )?;
        if let Some(n) = self.remaining.as_mut() {
            *n = n.saturating_sub(page.entries.len());
        }
        self.buffer.extend(page.entries);
        self.cursor = page.cursor;
        if self.cursor.is_none() || self.remaining == Some(0) {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for ListIter {
    type Item = KvdexResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
