//! Update merge strategies
//!
//! Rule set for the deep `Merge` strategy:
//! - plain objects: recurse per field
//! - arrays: concatenate (existing then patch)
//! - sets: union (patch members appended unless already present)
//! - maps: union (patch wins on equal keys)
//! - everything else: the patch replaces the existing value
//!
//! `MergeShallow` overlays object fields one level deep. `Replace`
//! discards the existing value. Non-object inputs always replace,
//! whatever the strategy.

use super::KvValue;

/// How `update` combines a patch with the existing document value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Discard the existing value entirely.
    Replace,
    /// Overlay object fields one level deep.
    MergeShallow,
    /// Deep merge per the rule set above. The default.
    #[default]
    Merge,
}

/// Combine `existing` and `patch` according to `strategy`.
pub fn merge(existing: &KvValue, patch: KvValue, strategy: MergeStrategy) -> KvValue {
    match strategy {
        MergeStrategy::Replace => patch,
        MergeStrategy::MergeShallow => merge_shallow(existing, patch),
        MergeStrategy::Merge => merge_deep(existing, patch),
    }
}

fn merge_shallow(existing: &KvValue, patch: KvValue) -> KvValue {
    match (existing, patch) {
        (KvValue::Object(old), KvValue::Object(new)) => {
            let mut out = old.clone();
            for (field, value) in new {
                out.insert(field, value);
            }
            KvValue::Object(out)
        }
        (_, patch) => patch,
    }
}

fn merge_deep(existing: &KvValue, patch: KvValue) -> KvValue {
    match (existing, patch) {
        (KvValue::Object(old), KvValue::Object(new)) => {
            let mut out = old.clone();
            for (field, value) in new {
                let merged = match out.get(&field) {
                    Some(current) => merge_deep(current, value),
                    None => value,
                };
                out.insert(field, merged);
            }
            KvValue::Object(out)
        }
        (KvValue::Array(old), KvValue::Array(new)) => {
            let mut out = old.clone();
            out.extend(new);
            KvValue::Array(out)
        }
        (KvValue::Set(old), KvValue::Set(new)) => {
            let mut out = old.clone();
            for member in new {
                if !out.contains(&member) {
                    out.push(member);
                }
            }
            KvValue::Set(out)
        }
        (KvValue::Map(old), KvValue::Map(new)) => {
            let mut out = old.clone();
            for (key, value) in new {
                match out.iter_mut().find(|(k, _)| *k == key) {
                    Some(entry) => entry.1 = value,
                    None => out.push((key, value)),
                }
            }
            KvValue::Map(out)
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn obj(entries: Vec<(&str, KvValue)>) -> KvValue {
        KvValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_replace_discards_existing() {
        let existing = obj(vec![("a", KvValue::Int(1))]);
        let patch = obj(vec![("b", KvValue::Int(2))]);
        let merged = merge(&existing, patch.clone(), MergeStrategy::Replace);
        assert_eq!(merged, patch);
    }

    #[test]
    fn test_deep_merge_preserves_unmentioned_fields() {
        let existing = obj(vec![
            ("username", KvValue::String("a".into())),
            ("age", KvValue::Int(20)),
            ("tags", KvValue::Array(vec![KvValue::String("x".into())])),
        ]);
        let patch = obj(vec![("age", KvValue::Int(99))]);
        let merged = merge(&existing, patch, MergeStrategy::Merge);
        assert_eq!(merged.get("username"), Some(&KvValue::String("a".into())));
        assert_eq!(merged.get("age"), Some(&KvValue::Int(99)));
        assert_eq!(
            merged.get("tags"),
            Some(&KvValue::Array(vec![KvValue::String("x".into())]))
        );
    }

    #[test]
    fn test_deep_merge_concatenates_arrays() {
        let existing = obj(vec![("xs", KvValue::Array(vec![KvValue::Int(1)]))]);
        let patch = obj(vec![("xs", KvValue::Array(vec![KvValue::Int(2)]))]);
        let merged = merge(&existing, patch, MergeStrategy::Merge);
        assert_eq!(
            merged.get("xs"),
            Some(&KvValue::Array(vec![KvValue::Int(1), KvValue::Int(2)]))
        );
    }

    #[test]
    fn test_deep_merge_unions_sets() {
        let existing = KvValue::Set(vec![KvValue::Int(1), KvValue::Int(2)]);
        let patch = KvValue::Set(vec![KvValue::Int(2), KvValue::Int(3)]);
        let merged = merge(&existing, patch, MergeStrategy::Merge);
        assert_eq!(
            merged,
            KvValue::Set(vec![KvValue::Int(1), KvValue::Int(2), KvValue::Int(3)])
        );
    }

    #[test]
    fn test_deep_merge_unions_maps_patch_wins() {
        let existing = KvValue::Map(vec![
            (KvValue::Int(1), KvValue::String("one".into())),
            (KvValue::Int(2), KvValue::String("two".into())),
        ]);
        let patch = KvValue::Map(vec![(KvValue::Int(2), KvValue::String("TWO".into()))]);
        let merged = merge(&existing, patch, MergeStrategy::Merge);
        assert_eq!(
            merged,
            KvValue::Map(vec![
                (KvValue::Int(1), KvValue::String("one".into())),
                (KvValue::Int(2), KvValue::String("TWO".into())),
            ])
        );
    }

    #[test]
    fn test_deep_merge_recurses_nested_objects() {
        let existing = obj(vec![(
            "profile",
            obj(vec![
                ("city", KvValue::String("oslo".into())),
                ("zip", KvValue::String("0150".into())),
            ]),
        )]);
        let patch = obj(vec![(
            "profile",
            obj(vec![("city", KvValue::String("bergen".into()))]),
        )]);
        let merged = merge(&existing, patch, MergeStrategy::Merge);
        let profile = merged.get("profile").unwrap();
        assert_eq!(profile.get("city"), Some(&KvValue::String("bergen".into())));
        assert_eq!(profile.get("zip"), Some(&KvValue::String("0150".into())));
    }

    #[test]
    fn test_shallow_merge_overlays_one_level() {
        let existing = obj(vec![
            ("a", obj(vec![("x", KvValue::Int(1))])),
            ("b", KvValue::Int(2)),
        ]);
        let patch = obj(vec![("a", obj(vec![("y", KvValue::Int(3))]))]);
        let merged = merge(&existing, patch, MergeStrategy::MergeShallow);
        // the nested object is replaced wholesale, "b" survives
        assert_eq!(merged.get("a"), Some(&obj(vec![("y", KvValue::Int(3))])));
        assert_eq!(merged.get("b"), Some(&KvValue::Int(2)));
    }

    #[test]
    fn test_non_object_always_replaces() {
        let existing = KvValue::Int(1);
        for strategy in [
            MergeStrategy::Replace,
            MergeStrategy::MergeShallow,
            MergeStrategy::Merge,
        ] {
            let merged = merge(&existing, KvValue::Int(2), strategy);
            assert_eq!(merged, KvValue::Int(2));
        }
    }
}
