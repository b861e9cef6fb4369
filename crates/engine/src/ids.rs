//! Id generation
//!
//! Document ids default to ULIDs: collision-resistant, time-ordered, and
//! lexicographically sortable, so fresh documents list in insertion
//! order. History entries use the same generator as their tie-breaking
//! time id. Scheduler topics use plain v4 UUIDs, which only need
//! uniqueness.

use kvdex_core::{KeyPart, KvValue};
use std::sync::Arc;

/// Produces a fresh document id, given the parsed document value.
pub type IdGenerator = Arc<dyn Fn(&KvValue) -> KeyPart + Send + Sync>;

/// A fresh ULID string.
pub fn ulid() -> String {
    ulid::Ulid::new().to_string()
}

/// A fresh time-ordered id part, used to key history entries.
pub fn time_id() -> KeyPart {
    KeyPart::String(ulid())
}

/// A fresh v4 UUID string, used for scheduler topics and undelivered ids.
pub fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The default document id generator (ULID, ignores the value).
pub fn default_id_generator() -> IdGenerator {
    Arc::new(|_| KeyPart::String(ulid()))
}
