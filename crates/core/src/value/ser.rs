//! Serde bridge, serializer half: arbitrary `Serialize` types → [`KvValue`].
//!
//! Mapping notes:
//! - `u64` becomes the unsigned-64 sentinel (`KvValue::U64`), so a
//!   collection of `u64` documents is eligible for `sum`/`min`/`max`.
//! - `i128`/`u128` become `BigInt` (u128 above `i128::MAX` is rejected).
//! - `None` and unit become `Null`; `Undefined` only arises from explicit
//!   `KvValue` usage.
//! - Map keys must serialize to strings, like `serde_json`.

use super::KvValue;
use crate::error::KvdexError;
use serde::ser::{self, Serialize};
use std::collections::BTreeMap;

pub(super) struct ValueSerializer;

type Result<T> = std::result::Result<T, KvdexError>;

impl ser::Serializer for ValueSerializer {
    type Ok = KvValue;
    type Error = KvdexError;

    type SerializeSeq = SerializeVec;
    type SerializeTuple = SerializeVec;
    type SerializeTupleStruct = SerializeVec;
    type SerializeTupleVariant = SerializeTupleVariant;
    type SerializeMap = SerializeMap;
    type SerializeStruct = SerializeMap;
    type SerializeStructVariant = SerializeStructVariant;

    fn serialize_bool(self, v: bool) -> Result<KvValue> {
        Ok(KvValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<KvValue> {
        Ok(KvValue::Int(v as i64))
    }

    fn serialize_i16(self, v: i16) -> Result<KvValue> {
        Ok(KvValue::Int(v as i64))
    }

    fn serialize_i32(self, v: i32) -> Result<KvValue> {
        Ok(KvValue::Int(v as i64))
    }

    fn serialize_i64(self, v: i64) -> Result<KvValue> {
        Ok(KvValue::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<KvValue> {
        Ok(KvValue::BigInt(v))
    }

    fn serialize_u8(self, v: u8) -> Result<KvValue> {
        Ok(KvValue::Int(v as i64))
    }

    fn serialize_u16(self, v: u16) -> Result<KvValue> {
        Ok(KvValue::Int(v as i64))
    }

    fn serialize_u32(self, v: u32) -> Result<KvValue> {
        Ok(KvValue::Int(v as i64))
    }

    fn serialize_u64(self, v: u64) -> Result<KvValue> {
        Ok(KvValue::U64(v))
    }

    fn serialize_u128(self, v: u128) -> Result<KvValue> {
        i128::try_from(v)
            .map(KvValue::BigInt)
            .map_err(|_| KvdexError::serialization("u128 value exceeds the bigint range"))
    }

    fn serialize_f32(self, v: f32) -> Result<KvValue> {
        Ok(KvValue::Float(v as f64))
    }

    fn serialize_f64(self, v: f64) -> Result<KvValue> {
        Ok(KvValue::Float(v))
    }

    fn serialize_char(self, v: char) -> Result<KvValue> {
        Ok(KvValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<KvValue> {
        Ok(KvValue::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<KvValue> {
        Ok(KvValue::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<KvValue> {
        Ok(KvValue::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<KvValue> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<KvValue> {
        Ok(KvValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<KvValue> {
        Ok(KvValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<KvValue> {
        Ok(KvValue::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<KvValue> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<KvValue> {
        let mut map = BTreeMap::new();
        map.insert(variant.to_string(), value.serialize(ValueSerializer)?);
        Ok(KvValue::Object(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(SerializeVec {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Ok(SerializeTupleVariant {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(SerializeMap {
            entries: BTreeMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Ok(SerializeStructVariant {
            variant,
            entries: BTreeMap::new(),
        })
    }
}

pub(super) struct SerializeVec {
    items: Vec<KvValue>,
}

impl ser::SerializeSeq for SerializeVec {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<KvValue> {
        Ok(KvValue::Array(self.items))
    }
}

impl ser::SerializeTuple for SerializeVec {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<KvValue> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeVec {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<KvValue> {
        ser::SerializeSeq::end(self)
    }
}

pub(super) struct SerializeTupleVariant {
    variant: &'static str,
    items: Vec<KvValue>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<KvValue> {
        let mut map = BTreeMap::new();
        map.insert(self.variant.to_string(), KvValue::Array(self.items));
        Ok(KvValue::Object(map))
    }
}

pub(super) struct SerializeMap {
    entries: BTreeMap<String, KvValue>,
    pending_key: Option<String>,
}

impl ser::SerializeMap for SerializeMap {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<()> {
        match key.serialize(ValueSerializer)? {
            KvValue::String(s) => {
                self.pending_key = Some(s);
                Ok(())
            }
            other => Err(KvdexError::serialization(format!(
                "map keys must be strings, got {}",
                other.type_name()
            ))),
        }
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| KvdexError::serialization("map value emitted before its key"))?;
        self.entries.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<KvValue> {
        Ok(KvValue::Object(self.entries))
    }
}

impl ser::SerializeStruct for SerializeMap {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.entries
            .insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<KvValue> {
        Ok(KvValue::Object(self.entries))
    }
}

pub(super) struct SerializeStructVariant {
    variant: &'static str,
    entries: BTreeMap<String, KvValue>,
}

impl ser::SerializeStructVariant for SerializeStructVariant {
    type Ok = KvValue;
    type Error = KvdexError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.entries
            .insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<KvValue> {
        let mut map = BTreeMap::new();
        map.insert(self.variant.to_string(), KvValue::Object(self.entries));
        Ok(KvValue::Object(map))
    }
}
