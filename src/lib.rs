//! kvdex: a typed, schema-driven document layer over an ordered KV store
//!
//! The engine maps typed document collections onto a tuple-keyed KV
//! primitive with atomic multi-mutation commits, optional primary and
//! secondary indexing, large-value segmentation with pluggable
//! serialization and compression, a per-document history log, a
//! persistent queue with topic dispatch and undelivered capture, and
//! change watching.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use kvdex::{
//!     kv_key, Backend, CollectionOptions, KvDex, MemoryKv, WriteOptions,
//! };
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct User {
//!     username: String,
//!     age: u32,
//! }
//!
//! # fn main() -> kvdex::KvdexResult<()> {
//! let backend: Arc<dyn Backend> = Arc::new(MemoryKv::new());
//! let db = KvDex::builder(backend)
//!     .collection::<User>(
//!         kv_key!["users"],
//!         CollectionOptions::new()
//!             .primary_index("username")
//!             .secondary_index("age"),
//!     )
//!     .build()?;
//!
//! let users = db.collection::<User>(&kv_key!["users"])?;
//! let result = users.add(
//!     &User { username: "alice".into(), age: 24 },
//!     &WriteOptions::default(),
//! )?;
//! assert!(result.is_ok());
//!
//! let found = users.find_by_primary_index("username", &"alice")?;
//! assert_eq!(found.unwrap().value.age, 24);
//! # db.close();
//! # Ok(())
//! # }
//! ```

pub use kvdex_core::{
    from_value, key, kv_key, limits, to_value, value, CommitResult, Document, ErrorValue, KeyPart,
    KvKey, KvLimits, KvValue, KvdexError, KvdexResult, MergeStrategy, Versionstamp, WriteResult,
};
pub use kvdex_engine::{
    AtomicBuilder, AtomicMutation, BatchedAtomic, BincodeSerializer, BrotliCompressor, Collection,
    CollectionKeys, CollectionOptions, Compressor, Encoder, EnqueueOptions, HistoryEntry,
    IdGenerator, IndexKind, IndexSpec, JsonSerializer, KvDex, KvDexBuilder, ListOptions,
    Paginated, SchedulerHandle, SchedulerMessage, SchedulerOptions, Serializer, UpdateOptions,
    WatchHandle, WatchOptions, WriteOptions, KVDEX_KEY_PREFIX,
};
pub use kvdex_kv::{
    AtomicOp, Backend, Consistency, Entry, ListIter, ListPage, ListSelector, MemoryKv,
    WatchStream,
};
