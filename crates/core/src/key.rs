//! Tuple keys
//!
//! Keys are sequences of primitive parts. The ordered KV contract sorts
//! keys lexicographically over their parts; within a single part, ordering
//! is first by type class, then by the part's natural order:
//!
//! ```text
//! bytes < string < number < bigint < boolean
//! ```
//!
//! `KvKey` derives its `Ord` from `KeyPart`, so a `BTreeMap<KvKey, _>` is
//! already in canonical store order. A key is always strictly less than any
//! key it is a proper prefix of, which is what prefix listing relies on.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// One primitive component of a tuple key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyPart {
    /// Raw byte string. Sorts before every other class.
    Bytes(Vec<u8>),
    /// UTF-8 string.
    String(String),
    /// 64-bit float. Integers fold into this class.
    Number(#[serde(with = "crate::value::float_bits")] f64),
    /// Arbitrary-size integer (bounded at 128 bits in this port).
    BigInt(i128),
    /// Boolean. Sorts after every other class.
    Bool(bool),
}

impl KeyPart {
    /// Rank of the part's type class in the canonical sort order.
    fn class_rank(&self) -> u8 {
        match self {
            KeyPart::Bytes(_) => 0,
            KeyPart::String(_) => 1,
            KeyPart::Number(_) => 2,
            KeyPart::BigInt(_) => 3,
            KeyPart::Bool(_) => 4,
        }
    }

    /// Approximate byte footprint of the part, used for atomic size accounting.
    pub fn byte_size(&self) -> usize {
        let payload = match self {
            KeyPart::Bytes(b) => b.len(),
            KeyPart::String(s) => s.len(),
            KeyPart::Number(_) => 8,
            KeyPart::BigInt(_) => 16,
            KeyPart::Bool(_) => 1,
        };
        // one tag byte plus one terminator byte per part
        payload + 2
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyPart::Bytes(a), KeyPart::Bytes(b)) => a == b,
            (KeyPart::String(a), KeyPart::String(b)) => a == b,
            (KeyPart::Number(a), KeyPart::Number(b)) => a.to_bits() == b.to_bits(),
            (KeyPart::BigInt(a), KeyPart::BigInt(b)) => a == b,
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KeyPart {}

impl Hash for KeyPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class_rank().hash(state);
        match self {
            KeyPart::Bytes(b) => b.hash(state),
            KeyPart::String(s) => s.hash(state),
            KeyPart::Number(n) => n.to_bits().hash(state),
            KeyPart::BigInt(i) => i.hash(state),
            KeyPart::Bool(b) => b.hash(state),
        }
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Bytes(a), KeyPart::Bytes(b)) => a.cmp(b),
            (KeyPart::String(a), KeyPart::String(b)) => a.cmp(b),
            (KeyPart::Number(a), KeyPart::Number(b)) => a.total_cmp(b),
            (KeyPart::BigInt(a), KeyPart::BigInt(b)) => a.cmp(b),
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a.cmp(b),
            _ => self.class_rank().cmp(&other.class_rank()),
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bytes(b) => write!(f, "0x{}", hex(b)),
            KeyPart::String(s) => write!(f, "{:?}", s),
            KeyPart::Number(n) => write!(f, "{}", n),
            KeyPart::BigInt(i) => write!(f, "{}n", i),
            KeyPart::Bool(b) => write!(f, "{}", b),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::String(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::String(s)
    }
}

impl From<f64> for KeyPart {
    fn from(n: f64) -> Self {
        KeyPart::Number(n)
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Number(n as f64)
    }
}

impl From<u32> for KeyPart {
    fn from(n: u32) -> Self {
        KeyPart::Number(n as f64)
    }
}

impl From<usize> for KeyPart {
    fn from(n: usize) -> Self {
        KeyPart::Number(n as f64)
    }
}

impl From<i128> for KeyPart {
    fn from(n: i128) -> Self {
        KeyPart::BigInt(n)
    }
}

impl From<bool> for KeyPart {
    fn from(b: bool) -> Self {
        KeyPart::Bool(b)
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(b: Vec<u8>) -> Self {
        KeyPart::Bytes(b)
    }
}

/// A tuple key: an ordered sequence of [`KeyPart`]s.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct KvKey(Vec<KeyPart>);

impl KvKey {
    /// Create an empty key.
    pub fn new() -> Self {
        KvKey(Vec::new())
    }

    /// Create a key from parts.
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        KvKey(parts)
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the key has no parts.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The parts as a slice.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Last part, if any.
    pub fn last(&self) -> Option<&KeyPart> {
        self.0.last()
    }

    /// Append a part in place.
    pub fn push(&mut self, part: impl Into<KeyPart>) {
        self.0.push(part.into());
    }

    /// Return a new key with one extra part appended.
    pub fn extended(&self, part: impl Into<KeyPart>) -> KvKey {
        let mut parts = self.0.clone();
        parts.push(part.into());
        KvKey(parts)
    }

    /// Return a new key with several extra parts appended.
    pub fn extended_with(&self, extra: impl IntoIterator<Item = KeyPart>) -> KvKey {
        let mut parts = self.0.clone();
        parts.extend(extra);
        KvKey(parts)
    }

    /// True when `self` begins with every part of `prefix`.
    pub fn starts_with(&self, prefix: &KvKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Approximate byte footprint of the whole key.
    pub fn byte_size(&self) -> usize {
        self.0.iter().map(KeyPart::byte_size).sum()
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<KeyPart>> for KvKey {
    fn from(parts: Vec<KeyPart>) -> Self {
        KvKey(parts)
    }
}

impl FromIterator<KeyPart> for KvKey {
    fn from_iter<I: IntoIterator<Item = KeyPart>>(iter: I) -> Self {
        KvKey(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[KeyPart; N]> for KvKey {
    fn from(parts: [KeyPart; N]) -> Self {
        KvKey(parts.to_vec())
    }
}

/// Build a [`KvKey`] from a list of part expressions.
///
/// ```
/// use kvdex_core::kv_key;
///
/// let key = kv_key!["users", 42i64, true];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! kv_key {
    ($($part:expr),* $(,)?) => {
        $crate::key::KvKey::from_parts(vec![$($crate::key::KeyPart::from($part)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // === Part ordering ===

    #[test]
    fn test_class_order() {
        let bytes = KeyPart::Bytes(vec![0xff]);
        let string = KeyPart::String("a".into());
        let number = KeyPart::Number(0.0);
        let bigint = KeyPart::BigInt(-100);
        let boolean = KeyPart::Bool(false);

        assert!(bytes < string);
        assert!(string < number);
        assert!(number < bigint);
        assert!(bigint < boolean);
    }

    #[test]
    fn test_within_class_order() {
        assert!(KeyPart::Bytes(vec![1]) < KeyPart::Bytes(vec![2]));
        assert!(KeyPart::String("a".into()) < KeyPart::String("b".into()));
        assert!(KeyPart::Number(1.0) < KeyPart::Number(2.0));
        assert!(KeyPart::Number(-1.0) < KeyPart::Number(0.0));
        assert!(KeyPart::BigInt(-5) < KeyPart::BigInt(5));
        assert!(KeyPart::Bool(false) < KeyPart::Bool(true));
    }

    #[test]
    fn test_nan_has_total_order() {
        let nan = KeyPart::Number(f64::NAN);
        let one = KeyPart::Number(1.0);
        // total_cmp puts positive NaN above every finite value
        assert_eq!(nan.cmp(&one), Ordering::Greater);
        assert_eq!(nan.cmp(&nan.clone()), Ordering::Equal);
    }

    #[test]
    fn test_prefix_sorts_before_extension() {
        let prefix = kv_key!["users"];
        let extended = kv_key!["users", "a"];
        assert!(prefix < extended);
        assert!(extended.starts_with(&prefix));
    }

    #[test]
    fn test_starts_with_rejects_sibling() {
        let a = kv_key!["users", "a"];
        let b = kv_key!["user"];
        assert!(!a.starts_with(&b));
    }

    // === Key construction ===

    #[test]
    fn test_extended_does_not_mutate() {
        let base = kv_key!["posts"];
        let child = base.extended("p1");
        assert_eq!(base.len(), 1);
        assert_eq!(child.len(), 2);
        assert_eq!(child.last(), Some(&KeyPart::String("p1".into())));
    }

    #[test]
    fn test_byte_size_counts_all_parts() {
        let key = kv_key!["ab", 1i64];
        // "ab" = 2 + 2 overhead, number = 8 + 2 overhead
        assert_eq!(key.byte_size(), 14);
    }

    #[test]
    fn test_serde_round_trip() {
        let key = kv_key!["users", 3.5f64, true, vec![1u8, 2]];
        let json = serde_json::to_string(&key).unwrap();
        let back: KvKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn test_display() {
        let key = kv_key!["users", 1i64];
        assert_eq!(key.to_string(), "[\"users\", 1]");
    }

    // === Property: ordering is a strict total order over mixed parts ===

    proptest::proptest! {
        #[test]
        fn prop_order_is_antisymmetric(a in part_strategy(), b in part_strategy()) {
            let ab = a.cmp(&b);
            let ba = b.cmp(&a);
            proptest::prop_assert_eq!(ab, ba.reverse());
        }

        #[test]
        fn prop_order_is_transitive(
            a in part_strategy(),
            b in part_strategy(),
            c in part_strategy()
        ) {
            let mut v = vec![a, b, c];
            v.sort();
            proptest::prop_assert!(v[0] <= v[1] && v[1] <= v[2] && v[0] <= v[2]);
        }
    }

    fn part_strategy() -> impl proptest::strategy::Strategy<Value = KeyPart> {
        use proptest::prelude::*;
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..8).prop_map(KeyPart::Bytes),
            "[a-z]{0,8}".prop_map(KeyPart::String),
            any::<f64>().prop_map(KeyPart::Number),
            any::<i128>().prop_map(KeyPart::BigInt),
            any::<bool>().prop_map(KeyPart::Bool),
        ]
    }
}
