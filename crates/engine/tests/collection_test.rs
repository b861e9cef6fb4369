//! Collection engine integration tests: CRUD, indexing, merge
//! strategies, traversal, and bulk deletion over the in-memory backend.

use kvdex_core::{kv_key, KeyPart, KvLimits, MergeStrategy, WriteResult};
use kvdex_engine::{
    CollectionOptions, KvDex, ListOptions, UpdateOptions, WriteOptions,
};
use kvdex_kv::{Backend, MemoryKv};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    username: String,
    age: u32,
    #[serde(default)]
    tags: Vec<String>,
}

fn user(username: &str, age: u32) -> User {
    User {
        username: username.to_string(),
        age,
        tags: Vec::new(),
    }
}

fn setup() -> KvDex {
    let backend: Arc<dyn Backend> = Arc::new(MemoryKv::with_limits(KvLimits::with_small_limits()));
    KvDex::builder(backend)
        .limits(KvLimits::with_small_limits())
        .collection::<User>(
            kv_key!["users"],
            CollectionOptions::new()
                .primary_index("username")
                .secondary_index("age"),
        )
        .collection::<User>(kv_key!["plain"], CollectionOptions::new())
        .collection::<u64>(kv_key!["numbers"], CollectionOptions::new())
        .build()
        .unwrap()
}

// === Round trips ===

#[test]
fn test_add_then_find_round_trips() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let value = User {
        username: "a".into(),
        age: 20,
        tags: vec!["x".into(), "y".into()],
    };
    let result = plain.add(&value, &WriteOptions::default()).unwrap();
    let id = result.id().unwrap().clone();

    let found = plain.find(&id).unwrap().unwrap();
    assert_eq!(found.value, value);
    assert_eq!(found.id, id);
}

#[test]
fn test_set_uses_explicit_id_and_rejects_collision() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let id = KeyPart::String("u1".into());

    assert!(plain
        .set(&id, &user("a", 1), &WriteOptions::default())
        .unwrap()
        .is_ok());
    // same id again: conflict
    assert_eq!(
        plain
            .set(&id, &user("b", 2), &WriteOptions::default())
            .unwrap(),
        WriteResult::Conflict
    );
    assert_eq!(plain.find(&id).unwrap().unwrap().value.username, "a");
}

#[test]
fn test_write_overwrites_id_collision() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let id = KeyPart::String("u1".into());

    plain.set(&id, &user("a", 1), &WriteOptions::default()).unwrap();
    assert!(plain
        .write(&id, &user("b", 2), &WriteOptions::default())
        .unwrap()
        .is_ok());
    assert_eq!(plain.find(&id).unwrap().unwrap().value.username, "b");
    assert_eq!(plain.count(&ListOptions::default()).unwrap(), 1);
}

#[test]
fn test_find_many_skips_missing() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let a = KeyPart::String("a".into());
    let b = KeyPart::String("b".into());
    plain.set(&a, &user("a", 1), &WriteOptions::default()).unwrap();

    let found = plain.find_many(&[a.clone(), b]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, a);
}

// === Indexing (scenario: users with unique username, non-unique age) ===

#[test]
fn test_primary_index_uniqueness() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();

    let first = users.add(&user("a", 20), &WriteOptions::default()).unwrap();
    assert!(first.is_ok());
    // same username: one success, one conflict
    let second = users.add(&user("a", 21), &WriteOptions::default()).unwrap();
    assert_eq!(second, WriteResult::Conflict);

    assert_eq!(users.count(&ListOptions::default()).unwrap(), 1);
    let found = users.find_by_primary_index("username", &"a").unwrap().unwrap();
    assert_eq!(found.value.age, 20);
}

#[test]
fn test_secondary_index_lists_matches() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    users.add(&user("a", 20), &WriteOptions::default()).unwrap();
    users.add(&user("b", 20), &WriteOptions::default()).unwrap();
    users.add(&user("c", 30), &WriteOptions::default()).unwrap();

    let twenty = users
        .find_by_secondary_index("age", &20u32, &ListOptions::default())
        .unwrap();
    assert_eq!(twenty.result.len(), 2);
    let thirty = users
        .find_by_secondary_index("age", &30u32, &ListOptions::default())
        .unwrap();
    assert_eq!(thirty.result.len(), 1);
    assert_eq!(thirty.result[0].value.username, "c");
}

#[test]
fn test_index_entries_deleted_with_document() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    let result = users.add(&user("a", 20), &WriteOptions::default()).unwrap();
    let id = result.id().unwrap().clone();

    users.delete(&[id]).unwrap();
    assert!(users.find_by_primary_index("username", &"a").unwrap().is_none());
    assert_eq!(
        users
            .find_by_secondary_index("age", &20u32, &ListOptions::default())
            .unwrap()
            .result
            .len(),
        0
    );
    // the username is free again
    assert!(users.add(&user("a", 25), &WriteOptions::default()).unwrap().is_ok());
}

#[test]
fn test_delete_by_primary_index() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    users.add(&user("a", 20), &WriteOptions::default()).unwrap();

    users.delete_by_primary_index("username", &"a").unwrap();
    assert_eq!(users.count(&ListOptions::default()).unwrap(), 0);
}

#[test]
fn test_update_by_primary_index_changes_secondary_entry() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    users.add(&user("a", 20), &WriteOptions::default()).unwrap();

    #[derive(Serialize)]
    struct Patch {
        age: u32,
    }
    let result = users
        .update_by_primary_index("username", &"a", &Patch { age: 30 }, &UpdateOptions::default())
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(
        users
            .find_by_secondary_index("age", &20u32, &ListOptions::default())
            .unwrap()
            .result
            .len(),
        0
    );
    assert_eq!(
        users
            .find_by_secondary_index("age", &30u32, &ListOptions::default())
            .unwrap()
            .result
            .len(),
        1
    );
}

#[test]
fn test_update_rejects_stealing_primary_index_value() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    users.add(&user("a", 20), &WriteOptions::default()).unwrap();
    let b = users.add(&user("b", 21), &WriteOptions::default()).unwrap();

    #[derive(Serialize)]
    struct Patch {
        username: String,
    }
    // "b" tries to become "a": the username is already indexed to another doc
    let result = users
        .update(
            b.id().unwrap(),
            &Patch {
                username: "a".into(),
            },
            &UpdateOptions::default(),
        )
        .unwrap();
    assert_eq!(result, WriteResult::Conflict);
    // untouched
    assert_eq!(users.count(&ListOptions::default()).unwrap(), 2);
    assert_eq!(
        users
            .find_by_primary_index("username", &"b")
            .unwrap()
            .unwrap()
            .value
            .age,
        21
    );
}

// === Update strategies ===

#[test]
fn test_update_merge_preserves_unmentioned_fields() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let id = KeyPart::String("u1".into());
    plain
        .set(
            &id,
            &User {
                username: "a".into(),
                age: 20,
                tags: vec!["x".into()],
            },
            &WriteOptions::default(),
        )
        .unwrap();

    #[derive(Serialize)]
    struct Patch {
        age: u32,
    }
    plain
        .update(&id, &Patch { age: 99 }, &UpdateOptions::default())
        .unwrap();

    let updated = plain.find(&id).unwrap().unwrap().value;
    assert_eq!(updated.username, "a");
    assert_eq!(updated.age, 99);
    assert_eq!(updated.tags, vec!["x".to_string()]);
}

#[test]
fn test_update_merge_concatenates_arrays() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let id = KeyPart::String("u1".into());
    plain
        .set(
            &id,
            &User {
                username: "a".into(),
                age: 20,
                tags: vec!["x".into()],
            },
            &WriteOptions::default(),
        )
        .unwrap();

    #[derive(Serialize)]
    struct Patch {
        tags: Vec<String>,
    }
    plain
        .update(
            &id,
            &Patch {
                tags: vec!["y".into()],
            },
            &UpdateOptions::default(),
        )
        .unwrap();

    assert_eq!(
        plain.find(&id).unwrap().unwrap().value.tags,
        vec!["x".to_string(), "y".to_string()]
    );
}

#[test]
fn test_update_replace_discards_existing() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let id = KeyPart::String("u1".into());
    plain
        .set(
            &id,
            &User {
                username: "a".into(),
                age: 20,
                tags: vec!["x".into()],
            },
            &WriteOptions::default(),
        )
        .unwrap();

    plain
        .update(
            &id,
            &User {
                username: "a".into(),
                age: 99,
                tags: Vec::new(),
            },
            &UpdateOptions {
                strategy: MergeStrategy::Replace,
                retry: 0,
            },
        )
        .unwrap();

    let updated = plain.find(&id).unwrap().unwrap().value;
    assert_eq!(updated.age, 99);
    assert!(updated.tags.is_empty());
}

#[test]
fn test_update_missing_document_is_conflict() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    let result = plain
        .update(
            &KeyPart::String("ghost".into()),
            &user("a", 1),
            &UpdateOptions::default(),
        )
        .unwrap();
    assert_eq!(result, WriteResult::Conflict);
}

// === Traversal ===

#[test]
fn test_filter_offset_take_ordering() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..10u32 {
        plain
            .set(
                &KeyPart::String(format!("u{:02}", i)),
                &user(&format!("name{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }

    let page = plain
        .get_many(&ListOptions {
            filter: Some(Arc::new(|doc| doc.value.age % 2 == 0)),
            offset: Some(1),
            take: Some(2),
            ..ListOptions::default()
        })
        .unwrap();
    // matches are ages 0,2,4,6,8; offset 1 drops age 0; take 2 keeps 2,4
    assert_eq!(page.result.len(), 2);
    assert_eq!(page.result[0].value.age, 2);
    assert_eq!(page.result[1].value.age, 4);
}

#[test]
fn test_reverse_traversal() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..3u32 {
        plain
            .set(
                &KeyPart::String(format!("u{}", i)),
                &user(&format!("n{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }
    let page = plain
        .get_many(&ListOptions {
            reverse: true,
            ..ListOptions::default()
        })
        .unwrap();
    assert_eq!(page.result[0].value.age, 2);
    assert_eq!(page.result[2].value.age, 0);
}

#[test]
fn test_cursor_resumes_traversal() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..6u32 {
        plain
            .set(
                &KeyPart::String(format!("u{}", i)),
                &user(&format!("n{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }

    let first = plain
        .get_many(&ListOptions {
            limit: Some(4),
            ..ListOptions::default()
        })
        .unwrap();
    assert_eq!(first.result.len(), 4);
    let cursor = first.cursor.expect("more entries remain");

    let rest = plain
        .get_many(&ListOptions {
            cursor: Some(cursor),
            ..ListOptions::default()
        })
        .unwrap();
    assert_eq!(rest.result.len(), 2);
    assert_eq!(rest.result[0].value.age, 4);
}

#[test]
fn test_for_each_and_map() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..4u32 {
        plain
            .set(
                &KeyPart::String(format!("u{}", i)),
                &user(&format!("n{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }

    let mut seen = 0;
    plain
        .for_each(&ListOptions::default(), |_| seen += 1)
        .unwrap();
    assert_eq!(seen, 4);

    let ages = plain
        .map(&ListOptions::default(), |doc| Ok(doc.value.age))
        .unwrap();
    assert_eq!(ages.result, vec![0, 1, 2, 3]);
}

#[test]
fn test_aggregate_errors_surface_after_traversal() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..3u32 {
        plain
            .set(
                &KeyPart::String(format!("u{}", i)),
                &user(&format!("n{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }

    let result = plain.map(&ListOptions::default(), |doc| {
        if doc.value.age == 1 {
            Err(kvdex_core::KvdexError::storage("boom"))
        } else {
            Ok(doc.value.age)
        }
    });
    let err = result.unwrap_err();
    assert!(err.is_aggregate());
}

// === Bulk deletion and counting ===

#[test]
fn test_delete_many_then_count_zero() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    for i in 0..5u32 {
        users
            .add(&user(&format!("u{}", i), i), &WriteOptions::default())
            .unwrap();
    }
    assert_eq!(users.count(&ListOptions::default()).unwrap(), 5);

    users.delete_many(&ListOptions::default()).unwrap();
    assert_eq!(users.count(&ListOptions::default()).unwrap(), 0);
    // index entries went with the documents
    assert_eq!(
        users
            .find_by_secondary_index("age", &2u32, &ListOptions::default())
            .unwrap()
            .result
            .len(),
        0
    );
}

#[test]
fn test_delete_many_with_filter_deletes_selectively() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..6u32 {
        plain
            .set(
                &KeyPart::String(format!("u{}", i)),
                &user(&format!("n{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }

    plain
        .delete_many(&ListOptions {
            filter: Some(Arc::new(|doc| doc.value.age < 3)),
            ..ListOptions::default()
        })
        .unwrap();
    assert_eq!(plain.count(&ListOptions::default()).unwrap(), 3);
}

#[test]
fn test_count_with_filter() {
    let db = setup();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    for i in 0..6u32 {
        plain
            .set(
                &KeyPart::String(format!("u{}", i)),
                &user(&format!("n{}", i), i),
                &WriteOptions::default(),
            )
            .unwrap();
    }
    let count = plain
        .count(&ListOptions {
            filter: Some(Arc::new(|doc| doc.value.age >= 4)),
            ..ListOptions::default()
        })
        .unwrap();
    assert_eq!(count, 2);
}

// === Facade-level operations ===

#[test]
fn test_count_all_and_delete_all() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    let plain = db.collection::<User>(&kv_key!["plain"]).unwrap();
    users.add(&user("a", 1), &WriteOptions::default()).unwrap();
    plain.add(&user("b", 2), &WriteOptions::default()).unwrap();

    assert_eq!(db.count_all().unwrap(), 2);
    db.delete_all().unwrap();
    assert_eq!(db.count_all().unwrap(), 0);
}

#[test]
fn test_wipe_clears_the_whole_tree() {
    let db = setup();
    let users = db.collection::<User>(&kv_key!["users"]).unwrap();
    users.add(&user("a", 1), &WriteOptions::default()).unwrap();

    db.wipe().unwrap();
    assert_eq!(db.count_all().unwrap(), 0);
    assert!(users.find_by_primary_index("username", &"a").unwrap().is_none());
}

#[test]
fn test_unknown_collection_path_errors() {
    let db = setup();
    assert!(db.collection::<User>(&kv_key!["nope"]).is_err());
    // registered path, wrong type
    assert!(db.collection::<u32>(&kv_key!["users"]).is_err());
}
