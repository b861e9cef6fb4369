//! Core types for kvdex
//!
//! This crate defines the vocabulary shared by every layer of the engine:
//! - Key: tuple keys built from ordered primitive parts
//! - Value: the unified document value model plus the serde bridge
//! - Document: read results, versionstamps, commit results
//! - Limits: tunable operational constants
//! - Error: the unified error taxonomy
//!
//! Nothing in this crate touches storage. Everything here is plain data
//! with the ordering and conversion rules the engine relies on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod key;
pub mod limits;
pub mod value;

pub use document::{CommitResult, Document, Versionstamp, WriteResult};
pub use error::{KvdexError, KvdexResult};
pub use key::{KeyPart, KvKey};
pub use limits::KvLimits;
pub use value::{from_value, to_value, ErrorValue, KvValue, MergeStrategy};
