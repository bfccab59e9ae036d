//! JSON encoding of field values, shared by every persistent cache tier.
//!
//! References are written as `"ApolloCacheReference{<key>}"`. Strings that could be mistaken for
//! a reference, or that start with the escape character, get a leading `\`.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeSeq;

use super::CacheReference;
use super::FieldValue;
use super::ScalarValue;
use crate::Value;

/// Prefix of an encoded [`CacheReference`].
pub const REFERENCE_PREFIX: &str = "ApolloCacheReference{";

const ESCAPE: char = '\\';

fn needs_escape(s: &str) -> bool {
    s.starts_with(ESCAPE) || s.starts_with(REFERENCE_PREFIX)
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Scalar(ScalarValue::Boolean(b)) => serializer.serialize_bool(*b),
            FieldValue::Scalar(ScalarValue::Number(n)) => n.serialize(serializer),
            FieldValue::Scalar(ScalarValue::String(s)) if needs_escape(s) => {
                serializer.serialize_str(&format!("{ESCAPE}{s}"))
            }
            FieldValue::Scalar(ScalarValue::String(s)) => serializer.serialize_str(s),
            FieldValue::Scalar(ScalarValue::Object(o)) => o.serialize(serializer),
            FieldValue::Reference(reference) => serializer.collect_str(reference),
            FieldValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(from_wire)
    }
}

fn from_wire(value: Value) -> FieldValue {
    match value {
        Value::String(s) => {
            let s = s.as_str();
            if let Some(unescaped) = s.strip_prefix(ESCAPE) {
                FieldValue::from(unescaped)
            } else if let Some(key) = s
                .strip_prefix(REFERENCE_PREFIX)
                .and_then(|rest| rest.strip_suffix('}'))
            {
                FieldValue::Reference(CacheReference::new(key))
            } else {
                FieldValue::from(s)
            }
        }
        Value::Array(items) => FieldValue::List(items.into_iter().map(from_wire).collect()),
        other => FieldValue::from_json(other),
    }
}
