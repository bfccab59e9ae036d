use std::fmt::Display;

use displaydoc::Display;
use serde::Serialize;
use serde::ser;
use thiserror::Error;

const BOOLEAN_WEIGHT: usize = 16;
const NUMBER_WEIGHT: usize = 32;
const NULL_WEIGHT: usize = 4;
const CONTAINER_OVERHEAD: usize = 16;

/// Rough in-memory weight of a value, used to bound the memory cache by size.
///
/// Strings weigh their byte length, so references weigh the length of their encoded form.
pub(crate) fn estimate_size<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut weigher = Weigher::default();
    match value.serialize(&mut weigher) {
        Ok(()) => weigher.weight,
        Err(err) => {
            tracing::debug!("could not weigh value: {err}");
            weigher.weight
        }
    }
}

/// {0}
#[derive(Debug, Display, Error)]
pub(crate) struct WeighError(String);

impl ser::Error for WeighError {
    fn custom<T: Display>(msg: T) -> Self {
        WeighError(msg.to_string())
    }
}

/// A serializer that adds up weights instead of producing output.
#[derive(Default)]
struct Weigher {
    weight: usize,
}

impl Weigher {
    fn add(&mut self, weight: usize) -> Result<(), WeighError> {
        self.weight += weight;
        Ok(())
    }
}

impl<'a> ser::Serializer for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> Result<(), WeighError> {
        self.add(BOOLEAN_WEIGHT)
    }

    fn serialize_i8(self, _v: i8) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_i16(self, _v: i16) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_i32(self, _v: i32) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_i64(self, _v: i64) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_u8(self, _v: u8) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_u16(self, _v: u16) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_u32(self, _v: u32) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_u64(self, _v: u64) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_f32(self, _v: f32) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_f64(self, _v: f64) -> Result<(), WeighError> {
        self.add(NUMBER_WEIGHT)
    }

    fn serialize_char(self, v: char) -> Result<(), WeighError> {
        self.add(v.len_utf8())
    }

    fn serialize_str(self, v: &str) -> Result<(), WeighError> {
        self.add(v.len())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), WeighError> {
        self.add(v.len())
    }

    fn serialize_none(self) -> Result<(), WeighError> {
        self.add(NULL_WEIGHT)
    }

    fn serialize_some<T>(self, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), WeighError> {
        self.add(NULL_WEIGHT)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), WeighError> {
        self.add(NULL_WEIGHT)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<(), WeighError> {
        self.add(variant.len())
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, WeighError> {
        self.add(CONTAINER_OVERHEAD)?;
        Ok(self)
    }
}

impl<'a> ser::SerializeSeq for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTuple for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleVariant for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

impl<'a> ser::SerializeMap for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        key.serialize(&mut **self)
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        self.weight += key.len();
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

impl<'a> ser::SerializeStructVariant for &'a mut Weigher {
    type Ok = ();
    type Error = WeighError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), WeighError>
    where
        T: ?Sized + Serialize,
    {
        self.weight += key.len();
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), WeighError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::record::CacheReference;
    use crate::record::FieldValue;

    #[test]
    fn scalars_have_fixed_weights() {
        assert_eq!(estimate_size(&FieldValue::Null), NULL_WEIGHT);
        assert_eq!(estimate_size(&FieldValue::from(true)), BOOLEAN_WEIGHT);
        assert_eq!(estimate_size(&FieldValue::from(42_i64)), NUMBER_WEIGHT);
        assert_eq!(estimate_size(&FieldValue::from("Luke")), 4);
    }

    #[test]
    fn containers_add_overhead() {
        let list = FieldValue::List(vec![FieldValue::from(true), FieldValue::Null]);
        assert_eq!(
            estimate_size(&list),
            CONTAINER_OVERHEAD + BOOLEAN_WEIGHT + NULL_WEIGHT
        );

        let object = FieldValue::from_json(json!({ "lat": 1, "lng": 2 }));
        assert_eq!(
            estimate_size(&object),
            CONTAINER_OVERHEAD + 3 + NUMBER_WEIGHT + 3 + NUMBER_WEIGHT
        );
    }

    #[test]
    fn references_weigh_their_encoded_form() {
        let reference = FieldValue::from(CacheReference::new("Character:1000"));
        assert_eq!(
            estimate_size(&reference),
            "ApolloCacheReference{Character:1000}".len()
        );
    }
}
