//! Flat records and the values they hold.

mod json;

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use indexmap::map::Entry;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Number;
use serde_json_bytes::ByteString;
use uuid::Uuid;

pub use self::json::REFERENCE_PREFIX;
use crate::Object;
use crate::Value;
use crate::size_estimation::estimate_size;

/// Fixed cost of a record, on top of its key and fields.
const RECORD_OVERHEAD: usize = 16;

/// A pointer to another [`Record`], by key.
///
/// References never own the record they name: the store is a graph, not a tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheReference {
    key: String,
}

impl CacheReference {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REFERENCE_PREFIX}{}}}", self.key)
    }
}

/// A leaf value stored in a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScalarValue {
    Boolean(bool),
    Number(Number),
    String(String),
    /// Only produced by custom scalar codecs that encode to a JSON object.
    Object(Object),
}

/// The value of a record field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Scalar(ScalarValue),
    Reference(CacheReference),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Converts a response value. Objects become opaque scalars: the normalizer replaces
    /// selected objects by references before they get here.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Scalar(ScalarValue::Boolean(b)),
            Value::Number(n) => FieldValue::Scalar(ScalarValue::Number(n)),
            Value::String(s) => FieldValue::Scalar(ScalarValue::String(s.as_str().to_string())),
            Value::Array(items) => {
                FieldValue::List(items.into_iter().map(FieldValue::from_json).collect())
            }
            Value::Object(o) => FieldValue::Scalar(ScalarValue::Object(o)),
        }
    }

    /// Converts back to a response value, or `None` if a reference is found.
    pub fn to_json(&self) -> Option<Value> {
        Some(match self {
            FieldValue::Null => Value::Null,
            FieldValue::Scalar(ScalarValue::Boolean(b)) => Value::Bool(*b),
            FieldValue::Scalar(ScalarValue::Number(n)) => Value::Number(n.clone()),
            FieldValue::Scalar(ScalarValue::String(s)) => {
                Value::String(ByteString::from(s.as_str()))
            }
            FieldValue::Scalar(ScalarValue::Object(o)) => Value::Object(o.clone()),
            FieldValue::Reference(_) => return None,
            FieldValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(FieldValue::to_json)
                    .collect::<Option<Vec<_>>>()?,
            ),
        })
    }

    /// Short description of the value kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Scalar(ScalarValue::Object(_)) => "object scalar",
            FieldValue::Scalar(_) => "scalar",
            FieldValue::Reference(_) => "reference",
            FieldValue::List(_) => "list",
        }
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a CacheReference>) {
        match self {
            FieldValue::Reference(reference) => out.push(reference),
            FieldValue::List(items) => items.iter().for_each(|item| item.collect_references(out)),
            FieldValue::Null | FieldValue::Scalar(_) => {}
        }
    }
}

impl From<CacheReference> for FieldValue {
    fn from(reference: CacheReference) -> Self {
        FieldValue::Reference(reference)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Scalar(ScalarValue::String(s.to_string()))
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Scalar(ScalarValue::Boolean(b))
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Scalar(ScalarValue::Number(n.into()))
    }
}

/// Identifies one field of one record.
///
/// Kept as a pair rather than a joined string so that keys containing `.` stay unambiguous.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordFieldKey {
    pub record: String,
    pub field: String,
}

impl RecordFieldKey {
    pub fn new(record: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            record: record.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for RecordFieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.record, self.field)
    }
}

/// Something a read or a write touched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependentKey {
    /// A whole record.
    Record(String),
    /// A single field of a record.
    Field(RecordFieldKey),
}

impl DependentKey {
    /// Whether a change to `changed` invalidates this dependency.
    pub fn is_affected_by(&self, changed: &RecordFieldKey) -> bool {
        match self {
            DependentKey::Record(key) => *key == changed.record,
            DependentKey::Field(field) => field == changed,
        }
    }
}

/// A flat, keyed bag of fields representing one normalized entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    key: String,
    fields: IndexMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<Uuid>,
    #[serde(skip)]
    size: OnceLock<usize>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.fields == other.fields && self.version == other.version
    }
}

impl Eq for Record {}

impl Record {
    pub fn builder(key: impl Into<String>) -> RecordBuilder {
        RecordBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn field(&self, field_key: &str) -> Option<&FieldValue> {
        self.fields.get(field_key)
    }

    pub fn has_field(&self, field_key: &str) -> bool {
        self.fields.contains_key(field_key)
    }

    pub fn fields(&self) -> &IndexMap<String, FieldValue> {
        &self.fields
    }

    /// The mutation that last wrote this record, if it was written optimistically.
    pub fn version(&self) -> Option<Uuid> {
        self.version
    }

    pub fn to_builder(&self) -> RecordBuilder {
        RecordBuilder {
            key: self.key.clone(),
            fields: self.fields.clone(),
            version: self.version,
        }
    }

    /// Keys of every field in this record.
    pub fn field_keys(&self) -> HashSet<RecordFieldKey> {
        self.fields
            .keys()
            .map(|field| RecordFieldKey::new(self.key.as_str(), field.as_str()))
            .collect()
    }

    /// Every reference held by this record, including those nested in lists.
    pub fn references(&self) -> Vec<&CacheReference> {
        let mut out = Vec::new();
        for value in self.fields.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Merges `other` into this record field by field, returning the fields that changed.
    ///
    /// Fields absent from `other` are left untouched. The version is taken from `other`.
    pub fn merge_with(&mut self, other: &Record) -> HashSet<RecordFieldKey> {
        let mut changed = HashSet::new();
        for (field_key, new_value) in &other.fields {
            let old_size = match self.fields.entry(field_key.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get() == new_value {
                        continue;
                    }
                    let old = entry.insert(new_value.clone());
                    Some(field_weight(field_key, &old))
                }
                Entry::Vacant(entry) => {
                    entry.insert(new_value.clone());
                    None
                }
            };
            if let Some(size) = self.size.get_mut() {
                let new_size = field_weight(field_key, new_value);
                *size = (*size + new_size).saturating_sub(old_size.unwrap_or_default());
            }
            changed.insert(RecordFieldKey::new(self.key.as_str(), field_key.as_str()));
        }
        self.version = other.version;
        changed
    }

    /// Approximate size of this record in bytes. Computed once, then adjusted on merge.
    pub fn size_estimate(&self) -> usize {
        *self.size.get_or_init(|| {
            RECORD_OVERHEAD
                + self.key.len()
                + self
                    .fields
                    .iter()
                    .map(|(field_key, value)| field_weight(field_key, value))
                    .sum::<usize>()
        })
    }
}

fn field_weight(field_key: &str, value: &FieldValue) -> usize {
    field_key.len() + estimate_size(value)
}

/// Builds a [`Record`].
#[derive(Clone, Debug)]
pub struct RecordBuilder {
    key: String,
    fields: IndexMap<String, FieldValue>,
    version: Option<Uuid>,
}

impl RecordBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: IndexMap::new(),
            version: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn add_field(mut self, field_key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field_key.into(), value.into());
        self
    }

    pub(crate) fn insert_field(&mut self, field_key: String, value: FieldValue) {
        self.fields.insert(field_key, value);
    }

    pub fn version(mut self, version: Option<Uuid>) -> Self {
        self.version = version;
        self
    }

    pub fn build(self) -> Record {
        Record {
            key: self.key,
            fields: self.fields,
            version: self.version,
            size: OnceLock::new(),
        }
    }
}

/// Records produced by one normalization pass, in the order they completed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordSet {
    records: IndexMap<String, Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record, merging it into any record already held under the same key.
    pub fn merge(&mut self, record: Record) -> HashSet<RecordFieldKey> {
        match self.records.entry(record.key.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().merge_with(&record),
            Entry::Vacant(entry) => entry.insert(record).field_keys(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Stamps every record with the given mutation id.
    pub fn stamp(&mut self, version: Uuid) {
        for record in self.records.values_mut() {
            record.version = Some(version);
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}
