//! Serde bridge, deserializer half: [`KvValue`] → arbitrary `Deserialize` types.

use super::{ErrorValue, KvValue};
use crate::error::KvdexError;
use serde::de::{
    DeserializeSeed, Deserializer, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};
use std::collections::btree_map;
use std::vec;

pub(super) struct ValueDeserializer {
    value: KvValue,
}

impl ValueDeserializer {
    pub(super) fn new(value: KvValue) -> Self {
        ValueDeserializer { value }
    }
}

type Result<T> = std::result::Result<T, KvdexError>;

impl<'de> Deserializer<'de> for ValueDeserializer {
    type Error = KvdexError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            KvValue::Undefined | KvValue::Null => visitor.visit_unit(),
            KvValue::Bool(b) => visitor.visit_bool(b),
            KvValue::Int(n) => visitor.visit_i64(n),
            KvValue::Float(n) => visitor.visit_f64(n),
            KvValue::BigInt(n) => visitor.visit_i128(n),
            KvValue::U64(n) => visitor.visit_u64(n),
            KvValue::String(s) => visitor.visit_string(s),
            KvValue::Bytes(b) => visitor.visit_byte_buf(b),
            KvValue::Array(items) | KvValue::Set(items) => {
                visit_seq(items, visitor)
            }
            KvValue::Object(map) => visit_object(map, visitor),
            KvValue::Map(pairs) => visit_pairs(pairs, visitor),
            KvValue::Timestamp(ms) => visitor.visit_i64(ms),
            KvValue::Regex(s) => visitor.visit_string(s),
            KvValue::Error(err) => visit_error(err, visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            KvValue::Undefined | KvValue::Null => visitor.visit_none(),
            value => visitor.visit_some(ValueDeserializer::new(value)),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.value {
            // unit variant
            KvValue::String(s) => visitor.visit_enum(s.into_deserializer()),
            // externally tagged: { "Variant": value }
            KvValue::Object(map) => {
                let mut iter = map.into_iter();
                let (tag, value) = match iter.next() {
                    Some(pair) => pair,
                    None => {
                        return Err(KvdexError::serialization(
                            "cannot read an enum from an empty object",
                        ))
                    }
                };
                if iter.next().is_some() {
                    return Err(KvdexError::serialization(
                        "enum objects must have exactly one key",
                    ));
                }
                visitor.visit_enum(EnumDeserializer { tag, value })
            }
            other => Err(KvdexError::serialization(format!(
                "cannot read an enum from {}",
                other.type_name()
            ))),
        }
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            KvValue::Bytes(b) => visitor.visit_byte_buf(b),
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            KvValue::Undefined | KvValue::Null => visitor.visit_unit(),
            other => Err(KvdexError::serialization(format!(
                "cannot read unit from {}",
                other.type_name()
            ))),
        }
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        unit_struct seq tuple tuple_struct map struct identifier ignored_any
    }
}

fn visit_seq<'de, V: Visitor<'de>>(items: Vec<KvValue>, visitor: V) -> Result<V::Value> {
    let mut access = SeqDeserializer {
        iter: items.into_iter(),
    };
    visitor.visit_seq(&mut access)
}

fn visit_object<'de, V: Visitor<'de>>(
    map: std::collections::BTreeMap<String, KvValue>,
    visitor: V,
) -> Result<V::Value> {
    let mut access = ObjectDeserializer {
        iter: map.into_iter(),
        pending: None,
    };
    visitor.visit_map(&mut access)
}

fn visit_pairs<'de, V: Visitor<'de>>(
    pairs: Vec<(KvValue, KvValue)>,
    visitor: V,
) -> Result<V::Value> {
    let mut access = PairsDeserializer {
        iter: pairs.into_iter(),
        pending: None,
    };
    visitor.visit_map(&mut access)
}

fn visit_error<'de, V: Visitor<'de>>(err: ErrorValue, visitor: V) -> Result<V::Value> {
    let mut map = std::collections::BTreeMap::new();
    map.insert("name".to_string(), KvValue::String(err.name));
    map.insert("message".to_string(), KvValue::String(err.message));
    map.insert(
        "stack".to_string(),
        err.stack.map(KvValue::String).unwrap_or(KvValue::Null),
    );
    visit_object(map, visitor)
}

struct SeqDeserializer {
    iter: vec::IntoIter<KvValue>,
}

impl<'de> SeqAccess<'de> for SeqDeserializer {
    type Error = KvdexError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        match self.iter.next() {
            Some(value) => seed.deserialize(ValueDeserializer::new(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct ObjectDeserializer {
    iter: btree_map::IntoIter<String, KvValue>,
    pending: Option<KvValue>,
}

impl<'de> MapAccess<'de> for ObjectDeserializer {
    type Error = KvdexError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(key.into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| KvdexError::serialization("map value requested before its key"))?;
        seed.deserialize(ValueDeserializer::new(value))
    }
}

struct PairsDeserializer {
    iter: vec::IntoIter<(KvValue, KvValue)>,
    pending: Option<KvValue>,
}

impl<'de> MapAccess<'de> for PairsDeserializer {
    type Error = KvdexError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(ValueDeserializer::new(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| KvdexError::serialization("map value requested before its key"))?;
        seed.deserialize(ValueDeserializer::new(value))
    }
}

struct EnumDeserializer {
    tag: String,
    value: KvValue,
}

impl<'de> EnumAccess<'de> for EnumDeserializer {
    type Error = KvdexError;
    type Variant = VariantDeserializer;

    fn variant_seed<V: DeserializeSeed<'de>>(
        self,
        seed: V,
    ) -> Result<(V::Value, Self::Variant)> {
        let tag = seed.deserialize(IntoDeserializer::<KvdexError>::into_deserializer(self.tag))?;
        Ok((tag, VariantDeserializer { value: self.value }))
    }
}

struct VariantDeserializer {
    value: KvValue,
}

impl<'de> VariantAccess<'de> for VariantDeserializer {
    type Error = KvdexError;

    fn unit_variant(self) -> Result<()> {
        match self.value {
            KvValue::Undefined | KvValue::Null => Ok(()),
            other => Err(KvdexError::serialization(format!(
                "unit variant carries unexpected {}",
                other.type_name()
            ))),
        }
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        seed.deserialize(ValueDeserializer::new(self.value))
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        match self.value {
            KvValue::Array(items) => visit_seq(items, visitor),
            other => Err(KvdexError::serialization(format!(
                "tuple variant expects an array, got {}",
                other.type_name()
            ))),
        }
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.value {
            KvValue::Object(map) => visit_object(map, visitor),
            other => Err(KvdexError::serialization(format!(
                "struct variant expects an object, got {}",
                other.type_name()
            ))),
        }
    }
}
