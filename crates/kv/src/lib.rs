//! KV primitive contract and the in-memory reference backend
//!
//! The engine depends only on the [`Backend`] trait defined here: an
//! ordered tuple-keyed store with atomic multi-mutation commits under
//! optimistic concurrency, prefix listing with resumable cursors, a
//! persistent queue with retry/undelivered capture, and per-key change
//! watching.
//!
//! [`MemoryKv`] backs the contract with an ordered map and an in-process
//! broker so the whole engine is testable without a native backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atomic;
pub mod backend;
pub mod memory;
pub mod selector;
pub mod watch;

pub use atomic::{AtomicOp, AtomicPayload, Check, Mutation};
pub use backend::{Backend, Consistency, EnqueueOptions, Entry, QueueHandler, SetOptions};
pub use memory::MemoryKv;
pub use selector::{decode_cursor, encode_cursor, ListIter, ListPage, ListSelector, PageRequest};
pub use watch::WatchStream;
