//! Collection engine for kvdex
//!
//! This crate maps the typed document model onto the KV primitive:
//! - Collection: per-collection CRUD, indexing, segmentation, history,
//!   traversal, queue surface, and watching
//! - AtomicBuilder: cross-collection atomic commits with the index
//!   collision gate
//! - BatchedAtomic: limit-respecting mutation batching for bulk paths
//! - KvDex: the database facade with schema composition, the global
//!   queue dispatcher, schedulers, and store-wide operations
//! - Encoder: pluggable serialization and compression for large values

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod atomic;
pub mod batch;
pub mod collection;
pub mod database;
pub mod encoder;
pub mod envelope;
pub mod ids;
pub mod keys;
pub mod scheduler;
pub mod watch;

pub use atomic::{AtomicBuilder, AtomicMutation};
pub use batch::BatchedAtomic;
pub use collection::options::{
    CollectionOptions, EnqueueOptions, HistoryEntry, IndexKind, IndexSpec, ListOptions, Paginated,
    UpdateOptions, WriteOptions,
};
pub use collection::Collection;
pub use database::{KvDex, KvDexBuilder};
pub use encoder::{
    BincodeSerializer, BrotliCompressor, Compressor, Encoder, JsonSerializer, Serializer,
};
pub use envelope::QueueRegistry;
pub use ids::IdGenerator;
pub use keys::{CollectionKeys, KVDEX_KEY_PREFIX};
pub use scheduler::{SchedulerHandle, SchedulerMessage, SchedulerOptions};
pub use watch::{WatchHandle, WatchOptions};
