//! The document value model
//!
//! `KvValue` is the unified in-memory shape of every stored document value.
//! It is deliberately wider than JSON: it distinguishes `Undefined` from
//! `Null`, round-trips `NaN` and the infinities, and carries big integers,
//! the unsigned-64 sentinel used by atomic counters, raw bytes, sets,
//! value-keyed maps, timestamps, regex sources, and error records.
//!
//! Serialization of a `KvValue` (JSON or binary) is always loss-free
//! because the enum is tagged. Arbitrary user types cross into this model
//! through the serde bridge: [`to_value`] / [`from_value`].

mod de;
mod merge;
mod ser;

pub use merge::{merge, MergeStrategy};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Captured error record (name, message, optional stack).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Error class name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional captured stack trace.
    pub stack: Option<String>,
}

/// Unified value type for document contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvValue {
    /// Absent value, distinct from `Null`.
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float. `NaN` and the infinities round-trip.
    Float(#[serde(with = "float_bits")] f64),
    /// Big integer (bounded at 128 bits in this port).
    BigInt(#[serde(with = "bigint_string")] i128),
    /// Unsigned 64-bit sentinel accepted by `sum`/`min`/`max` mutations.
    U64(u64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<KvValue>),
    /// String-keyed map with deterministic key order.
    Object(BTreeMap<String, KvValue>),
    /// Set of values. Union semantics under merge.
    Set(Vec<KvValue>),
    /// Value-keyed map, stored as pairs.
    Map(Vec<(KvValue, KvValue)>),
    /// Instant in time, milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Regular expression source.
    Regex(String),
    /// Captured error record.
    Error(ErrorValue),
}

// Floats compare by bit pattern so NaN-carrying values are equal to
// themselves, which keeps round-trip assertions meaningful.
impl PartialEq for KvValue {
    fn eq(&self, other: &Self) -> bool {
        use KvValue::*;
        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (BigInt(a), BigInt(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Set(a), Set(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (Regex(a), Regex(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            _ => false,
        }
    }
}

impl KvValue {
    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            KvValue::Undefined => "undefined",
            KvValue::Null => "null",
            KvValue::Bool(_) => "bool",
            KvValue::Int(_) => "int",
            KvValue::Float(_) => "float",
            KvValue::BigInt(_) => "bigint",
            KvValue::U64(_) => "u64",
            KvValue::String(_) => "string",
            KvValue::Bytes(_) => "bytes",
            KvValue::Array(_) => "array",
            KvValue::Object(_) => "object",
            KvValue::Set(_) => "set",
            KvValue::Map(_) => "map",
            KvValue::Timestamp(_) => "timestamp",
            KvValue::Regex(_) => "regex",
            KvValue::Error(_) => "error",
        }
    }

    /// True for `Undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, KvValue::Undefined)
    }

    /// Borrow the object map, if this is an `Object`.
    pub fn as_object(&self) -> Option<&BTreeMap<String, KvValue>> {
        match self {
            KvValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Mutably borrow the object map, if this is an `Object`.
    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, KvValue>> {
        match self {
            KvValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow the bytes, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            KvValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the unsigned-64 sentinel, if this is a `U64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            KvValue::U64(n) => Some(*n),
            _ => None,
        }
    }

    /// Read a field of an object value, if present.
    pub fn get(&self, field: &str) -> Option<&KvValue> {
        self.as_object().and_then(|map| map.get(field))
    }
}

// Display is the tagged JSON encoding; only used in error messages and
// tracing output.
impl fmt::Display for KvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unprintable value>"),
        }
    }
}

impl From<bool> for KvValue {
    fn from(b: bool) -> Self {
        KvValue::Bool(b)
    }
}

impl From<i64> for KvValue {
    fn from(n: i64) -> Self {
        KvValue::Int(n)
    }
}

impl From<f64> for KvValue {
    fn from(n: f64) -> Self {
        KvValue::Float(n)
    }
}

impl From<u64> for KvValue {
    fn from(n: u64) -> Self {
        KvValue::U64(n)
    }
}

impl From<&str> for KvValue {
    fn from(s: &str) -> Self {
        KvValue::String(s.to_string())
    }
}

impl From<String> for KvValue {
    fn from(s: String) -> Self {
        KvValue::String(s)
    }
}

impl From<Vec<u8>> for KvValue {
    fn from(b: Vec<u8>) -> Self {
        KvValue::Bytes(b)
    }
}

/// Convert any serializable value into a [`KvValue`].
pub fn to_value<T: Serialize>(value: &T) -> crate::error::KvdexResult<KvValue> {
    value.serialize(ser::ValueSerializer)
}

/// Convert a [`KvValue`] back into a concrete type.
pub fn from_value<T: serde::de::DeserializeOwned>(value: KvValue) -> crate::error::KvdexResult<T> {
    T::deserialize(de::ValueDeserializer::new(value))
}

// Floats travel as their bit pattern: JSON would otherwise flatten NaN
// and the infinities to null, and the binary codec needs a
// self-contained representation too.
pub(crate) mod float_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(f64::from_bits(u64::deserialize(deserializer)?))
    }
}

// i128 does not fit JSON numbers, so big integers travel as strings.
mod bigint_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<i128>().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    // === Enum round-trips ===

    #[test]
    fn test_json_round_trip_exotics() {
        let values = vec![
            KvValue::Undefined,
            KvValue::Null,
            KvValue::Float(f64::NAN),
            KvValue::Float(f64::INFINITY),
            KvValue::Float(f64::NEG_INFINITY),
            KvValue::BigInt(i128::MAX),
            KvValue::U64(u64::MAX),
            KvValue::Bytes(vec![0, 1, 255]),
            KvValue::Set(vec![KvValue::Int(1), KvValue::Int(2)]),
            KvValue::Map(vec![(KvValue::Int(1), KvValue::String("one".into()))]),
            KvValue::Timestamp(1_700_000_000_000),
            KvValue::Regex("^a+$".into()),
            KvValue::Error(ErrorValue {
                name: "TypeError".into(),
                message: "boom".into(),
                stack: None,
            }),
        ];
        for v in values {
            let json = serde_json::to_string(&v).unwrap();
            let back: KvValue = serde_json::from_str(&json).unwrap();
            assert_eq!(v, back, "round trip failed for {}", json);
        }
    }

    #[test]
    fn test_bincode_round_trip() {
        let v = KvValue::Object(
            [
                ("big".to_string(), KvValue::BigInt(-1)),
                ("bytes".to_string(), KvValue::Bytes(vec![9, 9])),
            ]
            .into_iter()
            .collect(),
        );
        let bytes = bincode::serialize(&v).unwrap();
        let back: KvValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_undefined_distinct_from_null() {
        assert_ne!(KvValue::Undefined, KvValue::Null);
        let undef = serde_json::to_string(&KvValue::Undefined).unwrap();
        let null = serde_json::to_string(&KvValue::Null).unwrap();
        assert_ne!(undef, null);
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(KvValue::Float(f64::NAN), KvValue::Float(f64::NAN));
    }

    // === Serde bridge ===

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        username: String,
        age: u32,
        tags: Vec<String>,
        nickname: Option<String>,
    }

    #[test]
    fn test_bridge_struct_round_trip() {
        let user = User {
            username: "alice".into(),
            age: 24,
            tags: vec!["a".into(), "b".into()],
            nickname: None,
        };
        let value = to_value(&user).unwrap();
        assert_eq!(
            value.get("username"),
            Some(&KvValue::String("alice".into()))
        );
        let back: User = from_value(value).unwrap();
        assert_eq!(user, back);
    }

    #[test]
    fn test_bridge_u64_maps_to_sentinel() {
        let value = to_value(&10u64).unwrap();
        assert_eq!(value, KvValue::U64(10));
        let back: u64 = from_value(value).unwrap();
        assert_eq!(back, 10);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Point,
        Circle { radius: f64 },
        Pair(i64, i64),
    }

    #[test]
    fn test_bridge_enum_round_trip() {
        for shape in [Shape::Point, Shape::Circle { radius: 2.5 }, Shape::Pair(1, 2)] {
            let value = to_value(&shape).unwrap();
            let back: Shape = from_value(value).unwrap();
            assert_eq!(shape, back);
        }
    }

    #[test]
    fn test_bridge_map_with_non_string_keys_fails() {
        use std::collections::BTreeMap;
        let mut map = BTreeMap::new();
        map.insert(1u32, "one");
        assert!(to_value(&map).is_err());
    }

    #[test]
    fn test_bridge_kv_value_identity() {
        // A KvValue pushed through the bridge comes back tagged, not flattened.
        let v = KvValue::Int(5);
        let reparsed: KvValue = from_value(to_value(&v).unwrap()).unwrap();
        assert_eq!(v, reparsed);
    }
}
