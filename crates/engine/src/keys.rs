//! Key plumbing
//!
//! Every engine-managed key lives under the reserved root part. Under a
//! collection's user-chosen path the engine reserves sub-prefixes for
//! document entries, value segments, index entries, history, and
//! undelivered queue captures. User paths must not use the reserved
//! parts.

use crate::collection::options::{IndexKind, IndexSpec};
use kvdex_core::{KeyPart, KvKey, KvValue, KvdexError, KvdexResult};

/// Reserved root part for every engine-managed key.
pub const KVDEX_KEY_PREFIX: &str = "__kvdex__";
/// Sub-prefix of canonical document entries.
pub const ID_KEY_PREFIX: &str = "__id__";
/// Sub-prefix of value segments.
pub const SEGMENT_KEY_PREFIX: &str = "__segment__";
/// Sub-prefix of unique index entries.
pub const PRIMARY_INDEX_KEY_PREFIX: &str = "__index_primary__";
/// Sub-prefix of non-unique index entries.
pub const SECONDARY_INDEX_KEY_PREFIX: &str = "__index_secondary__";
/// Sub-prefix of the per-document history log.
pub const HISTORY_KEY_PREFIX: &str = "__history__";
/// Sub-prefix of captured undelivered queue messages.
pub const UNDELIVERED_KEY_PREFIX: &str = "__undelivered__";

/// Field carrying the document id inside a primary index entry.
pub const ID_FIELD: &str = "__id__";

const RESERVED_PARTS: [&str; 7] = [
    KVDEX_KEY_PREFIX,
    ID_KEY_PREFIX,
    SEGMENT_KEY_PREFIX,
    PRIMARY_INDEX_KEY_PREFIX,
    SECONDARY_INDEX_KEY_PREFIX,
    HISTORY_KEY_PREFIX,
    UNDELIVERED_KEY_PREFIX,
];

/// True when `part` is one of the engine's reserved key parts.
pub fn is_reserved_part(part: &KeyPart) -> bool {
    matches!(part, KeyPart::String(s) if RESERVED_PARTS.contains(&s.as_str()))
}

/// The root key every engine-managed key descends from.
pub fn root_key() -> KvKey {
    KvKey::from_parts(vec![KeyPart::String(KVDEX_KEY_PREFIX.to_string())])
}

/// All reserved sub-prefixes of one collection.
#[derive(Debug, Clone)]
pub struct CollectionKeys {
    /// The collection's own prefix: root plus the user path.
    pub base: KvKey,
    /// Canonical document entries.
    pub id: KvKey,
    /// Value segments of encoded documents.
    pub segment: KvKey,
    /// Unique index entries.
    pub primary_index: KvKey,
    /// Non-unique index entries.
    pub secondary_index: KvKey,
    /// History log entries.
    pub history: KvKey,
    /// Segments of historical writes.
    pub history_segment: KvKey,
    /// Captured undelivered queue messages.
    pub undelivered: KvKey,
}

impl CollectionKeys {
    /// Derive all sub-prefixes from a user-chosen collection path.
    ///
    /// Rejects empty paths and paths using reserved parts.
    pub fn new(path: &KvKey) -> KvdexResult<Self> {
        if path.is_empty() {
            return Err(KvdexError::invalid_collection("collection path is empty"));
        }
        if let Some(part) = path.parts().iter().find(|p| is_reserved_part(p)) {
            return Err(KvdexError::invalid_collection(format!(
                "collection path uses reserved part {}",
                part
            )));
        }
        let base = root_key().extended_with(path.parts().to_vec());
        Ok(CollectionKeys {
            id: base.extended(ID_KEY_PREFIX),
            segment: base.extended(SEGMENT_KEY_PREFIX),
            primary_index: base.extended(PRIMARY_INDEX_KEY_PREFIX),
            secondary_index: base.extended(SECONDARY_INDEX_KEY_PREFIX),
            history: base.extended(HISTORY_KEY_PREFIX),
            history_segment: base
                .extended(HISTORY_KEY_PREFIX)
                .extended(SEGMENT_KEY_PREFIX),
            undelivered: base.extended(UNDELIVERED_KEY_PREFIX),
            base,
        })
    }
}

/// Convert a key part to its value form, for storing ids inside entries.
pub fn key_part_to_value(part: &KeyPart) -> KvValue {
    match part {
        KeyPart::Bytes(b) => KvValue::Bytes(b.clone()),
        KeyPart::String(s) => KvValue::String(s.clone()),
        KeyPart::Number(n) => KvValue::Float(*n),
        KeyPart::BigInt(i) => KvValue::BigInt(*i),
        KeyPart::Bool(b) => KvValue::Bool(*b),
    }
}

/// Convert a value back into a key part. Only primitive values qualify.
pub fn value_to_key_part(value: &KvValue) -> KvdexResult<KeyPart> {
    match value {
        KvValue::Bytes(b) => Ok(KeyPart::Bytes(b.clone())),
        KvValue::String(s) => Ok(KeyPart::String(s.clone())),
        KvValue::Float(n) => Ok(KeyPart::Number(*n)),
        KvValue::Int(n) => Ok(KeyPart::Number(*n as f64)),
        KvValue::U64(n) => Ok(KeyPart::Number(*n as f64)),
        KvValue::BigInt(i) => Ok(KeyPart::BigInt(*i)),
        KvValue::Bool(b) => Ok(KeyPart::Bool(*b)),
        other => Err(KvdexError::invalid_input(format!(
            "{} cannot be used as a document id",
            other.type_name()
        ))),
    }
}

/// Fixed-byte index keying of a field value: equal values must map to
/// identical tuple keys, so the deterministic JSON encoding is used.
pub fn encode_index_value(value: &KvValue) -> KvdexResult<KeyPart> {
    Ok(KeyPart::Bytes(serde_json::to_vec(value)?))
}

/// One index entry to maintain alongside a document write or delete.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Full index entry key.
    pub key: KvKey,
    /// Unique or non-unique.
    pub kind: IndexKind,
    /// Value stored at the entry key.
    pub value: KvValue,
}

/// Compute every index entry for a document.
///
/// `doc_value` is the parsed document (field source); `stored_value` is
/// what the id key stores (the raw value, or the segment sentinel for
/// encoded collections). Fields that are absent or `Undefined` are not
/// indexed.
pub fn index_entries(
    keys: &CollectionKeys,
    indices: &[IndexSpec],
    id: &KeyPart,
    doc_value: &KvValue,
    stored_value: &KvValue,
) -> KvdexResult<Vec<IndexEntry>> {
    if indices.is_empty() {
        return Ok(Vec::new());
    }
    let fields = doc_value.as_object().ok_or_else(|| {
        KvdexError::invalid_input(format!(
            "indexable collections store object documents, got {}",
            doc_value.type_name()
        ))
    })?;

    let mut entries = Vec::new();
    for spec in indices {
        let field_value = match fields.get(&spec.field) {
            Some(v) if !v.is_undefined() => v,
            _ => continue,
        };
        let encoded = encode_index_value(field_value)?;
        match spec.kind {
            IndexKind::Primary => {
                let key = keys
                    .primary_index
                    .extended(spec.field.as_str())
                    .extended(encoded);
                // the entry carries the document plus a back-reference
                let mut value = match stored_value.as_object() {
                    Some(map) => map.clone(),
                    None => {
                        return Err(KvdexError::invalid_input(
                            "primary index entries require object document values",
                        ))
                    }
                };
                value.insert(ID_FIELD.to_string(), key_part_to_value(id));
                entries.push(IndexEntry {
                    key,
                    kind: IndexKind::Primary,
                    value: KvValue::Object(value),
                });
            }
            IndexKind::Secondary => {
                let key = keys
                    .secondary_index
                    .extended(spec.field.as_str())
                    .extended(encoded)
                    .extended(id.clone());
                entries.push(IndexEntry {
                    key,
                    kind: IndexKind::Secondary,
                    value: stored_value.clone(),
                });
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvdex_core::kv_key;

    #[test]
    fn test_collection_keys_layout() {
        let keys = CollectionKeys::new(&kv_key!["auth", "users"]).unwrap();
        assert_eq!(keys.base, kv_key![KVDEX_KEY_PREFIX, "auth", "users"]);
        assert_eq!(
            keys.id,
            kv_key![KVDEX_KEY_PREFIX, "auth", "users", ID_KEY_PREFIX]
        );
        assert!(keys.history_segment.starts_with(&keys.history));
    }

    #[test]
    fn test_reserved_path_rejected() {
        assert!(CollectionKeys::new(&kv_key!["__id__"]).is_err());
        assert!(CollectionKeys::new(&kv_key!["ok", "__segment__"]).is_err());
        assert!(CollectionKeys::new(&kv_key![]).is_err());
    }

    #[test]
    fn test_key_part_value_round_trip() {
        for part in [
            KeyPart::String("x".into()),
            KeyPart::Number(1.5),
            KeyPart::BigInt(7),
            KeyPart::Bool(true),
            KeyPart::Bytes(vec![1, 2]),
        ] {
            let value = key_part_to_value(&part);
            assert_eq!(value_to_key_part(&value).unwrap(), part);
        }
    }

    #[test]
    fn test_equal_values_produce_equal_index_parts() {
        let a = KvValue::String("same".into());
        let b = KvValue::String("same".into());
        assert_eq!(
            encode_index_value(&a).unwrap(),
            encode_index_value(&b).unwrap()
        );
    }

    #[test]
    fn test_index_entries_skip_missing_fields() {
        let keys = CollectionKeys::new(&kv_key!["users"]).unwrap();
        let indices = vec![
            IndexSpec::primary("username"),
            IndexSpec::secondary("age"),
        ];
        let doc = KvValue::Object(
            [("username".to_string(), KvValue::String("a".into()))]
                .into_iter()
                .collect(),
        );
        let id = KeyPart::String("d1".into());
        let entries = index_entries(&keys, &indices, &id, &doc, &doc).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].kind, IndexKind::Primary));
        // back-reference present
        assert_eq!(
            entries[0].value.get(ID_FIELD),
            Some(&KvValue::String("d1".into()))
        );
    }

    #[test]
    fn test_secondary_entry_key_ends_with_doc_id() {
        let keys = CollectionKeys::new(&kv_key!["users"]).unwrap();
        let indices = vec![IndexSpec::secondary("age")];
        let doc = KvValue::Object(
            [("age".to_string(), KvValue::Int(20))].into_iter().collect(),
        );
        let id = KeyPart::String("d1".into());
        let entries = index_entries(&keys, &indices, &id, &doc, &doc).unwrap();
        assert_eq!(entries[0].key.last(), Some(&id));
    }

    #[test]
    fn test_non_object_document_rejected_for_indexing() {
        let keys = CollectionKeys::new(&kv_key!["nums"]).unwrap();
        let indices = vec![IndexSpec::primary("x")];
        let id = KeyPart::String("d1".into());
        let doc = KvValue::Int(5);
        assert!(index_entries(&keys, &indices, &id, &doc, &doc).is_err());
    }
}
