//! Encoded-collection tests: segmentation, compression, corruption
//! detection, history reassembly, and index entries over sentinels.

use kvdex_core::{kv_key, KeyPart, KvLimits};
use kvdex_engine::{
    CollectionOptions, Encoder, HistoryEntry, KvDex, ListOptions, UpdateOptions, WriteOptions,
};
use kvdex_kv::{Backend, MemoryKv};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    title: String,
    body: String,
}

// Small chunks force segmentation without the tiny atomic caps that
// would split a single document write.
fn segment_limits() -> KvLimits {
    KvLimits {
        value_byte_limit: 64,
        get_many_key_limit: 3,
        ..KvLimits::default()
    }
}

fn setup(encoder: Encoder) -> (KvDex, Arc<dyn Backend>) {
    let backend: Arc<dyn Backend> = Arc::new(MemoryKv::with_limits(segment_limits()));
    let db = KvDex::builder(Arc::clone(&backend))
        .limits(segment_limits())
        .collection::<Note>(
            kv_key!["notes"],
            CollectionOptions::new().encoder(encoder).history(),
        )
        .collection::<String>(
            kv_key!["texts"],
            CollectionOptions::new().encoder(Encoder::json()),
        )
        .collection::<Note>(
            kv_key!["titled"],
            CollectionOptions::new()
                .encoder(Encoder::binary())
                .primary_index("title"),
        )
        .build()
        .unwrap();
    (db, backend)
}

#[test]
fn test_large_value_round_trips_through_segments() {
    let (db, _backend) = setup(Encoder::json());
    let texts = db.collection::<String>(&kv_key!["texts"]).unwrap();
    let id = KeyPart::String("k".into());
    // far larger than the 64-byte test chunk limit
    let value = "A".repeat(20_000);

    texts.set(&id, &value, &WriteOptions::default()).unwrap();
    let found = texts.find(&id).unwrap().unwrap();
    assert_eq!(found.value.len(), 20_000);
    assert_eq!(found.value, value);
}

#[test]
fn test_binary_and_compressed_encoders_round_trip() {
    for encoder in [
        Encoder::json(),
        Encoder::json_compressed(),
        Encoder::binary(),
        Encoder::binary_compressed(),
    ] {
        let (db, _backend) = setup(encoder);
        let notes = db.collection::<Note>(&kv_key!["notes"]).unwrap();
        let note = Note {
            title: "t".into(),
            body: "b".repeat(500),
        };
        let result = notes.add(&note, &WriteOptions::default()).unwrap();
        let found = notes.find(result.id().unwrap()).unwrap().unwrap();
        assert_eq!(found.value, note);
    }
}

#[test]
fn test_corrupted_segment_is_detected() {
    let (db, backend) = setup(Encoder::json());
    let texts = db.collection::<String>(&kv_key!["texts"]).unwrap();
    let id = KeyPart::String("k".into());
    texts
        .set(&id, &"A".repeat(1000), &WriteOptions::default())
        .unwrap();

    // remove one chunk behind the engine's back
    let segment_key = kv_key!["__kvdex__", "texts", "__segment__", "k", 1i64];
    backend.delete(&segment_key).unwrap();

    let err = texts.find(&id).unwrap_err();
    assert!(err.is_corruption(), "expected corruption, got {}", err);
}

#[test]
fn test_delete_removes_segments() {
    let (db, backend) = setup(Encoder::json());
    let texts = db.collection::<String>(&kv_key!["texts"]).unwrap();
    let id = KeyPart::String("k".into());
    texts
        .set(&id, &"A".repeat(500), &WriteOptions::default())
        .unwrap();
    texts.delete(&[id.clone()]).unwrap();

    assert!(texts.find(&id).unwrap().is_none());
    let first_segment = kv_key!["__kvdex__", "texts", "__segment__", "k", 0i64];
    let entry = backend
        .get(&first_segment, kvdex_kv::Consistency::Strong)
        .unwrap();
    assert!(!entry.is_present());
}

#[test]
fn test_primary_index_over_encoded_collection() {
    let (db, _backend) = setup(Encoder::json());
    let titled = db.collection::<Note>(&kv_key!["titled"]).unwrap();
    let note = Note {
        title: "unique".into(),
        body: "x".repeat(300),
    };
    titled.add(&note, &WriteOptions::default()).unwrap();

    // the index entry stores the sentinel; lookup reassembles the value
    let found = titled
        .find_by_primary_index("title", &"unique")
        .unwrap()
        .unwrap();
    assert_eq!(found.value, note);

    // uniqueness still holds
    let dup = titled.add(&note, &WriteOptions::default()).unwrap();
    assert!(!dup.is_ok());
}

#[test]
fn test_history_reassembles_segmented_writes() {
    let (db, _backend) = setup(Encoder::json());
    let notes = db.collection::<Note>(&kv_key!["notes"]).unwrap();
    let id = KeyPart::String("n1".into());

    let v1 = Note {
        title: "first".into(),
        body: "1".repeat(200),
    };
    let v2 = Note {
        title: "second".into(),
        body: "2".repeat(200),
    };
    notes.set(&id, &v1, &WriteOptions::default()).unwrap();
    #[derive(Serialize)]
    struct Patch {
        title: String,
        body: String,
    }
    notes
        .update(
            &id,
            &Patch {
                title: v2.title.clone(),
                body: v2.body.clone(),
            },
            &UpdateOptions::default(),
        )
        .unwrap();
    notes.delete(&[id.clone()]).unwrap();

    let history = notes.find_history(&id).unwrap();
    assert_eq!(history.len(), 3);
    match &history[0] {
        HistoryEntry::Write { value, .. } => assert_eq!(value, &v1),
        other => panic!("expected write entry, got {:?}", other),
    }
    match &history[1] {
        HistoryEntry::Write { value, .. } => assert_eq!(value, &v2),
        other => panic!("expected write entry, got {:?}", other),
    }
    assert!(matches!(history[2], HistoryEntry::Delete { .. }));

    // timestamps are monotonic non-decreasing
    let stamps: Vec<i64> = history.iter().map(|e| e.timestamp()).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_delete_many_sweeps_segments() {
    let (db, backend) = setup(Encoder::json());
    let texts = db.collection::<String>(&kv_key!["texts"]).unwrap();
    for i in 0..3i64 {
        texts
            .set(
                &KeyPart::Number(i as f64),
                &"A".repeat(300),
                &WriteOptions::default(),
            )
            .unwrap();
    }
    texts.delete_many(&ListOptions::default()).unwrap();
    assert_eq!(texts.count(&ListOptions::default()).unwrap(), 0);

    // no segment entries survive the sweep
    let page = backend
        .list_page(
            &kvdex_kv::ListSelector::Prefix {
                prefix: kv_key!["__kvdex__", "texts", "__segment__"],
            },
            &kvdex_kv::PageRequest::default(),
        )
        .unwrap();
    assert!(page.entries.is_empty());
}
