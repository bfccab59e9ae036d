//! Response normalization: nested responses into flat records.
//!
//! [`ResponseNormalizer`] is a visitor driven by callbacks fired while a response is walked. It
//! keeps three stacks: the response path (to synthesize keys for objects without an identity),
//! the records in progress for each enclosing object, and the values waiting to be attached to
//! their field. [`ResponseWriter`] walks a JSON response against [`ResponseField`] selections and
//! fires those callbacks.

use std::collections::HashSet;
use std::mem;

use crate::Object;
use crate::Value;
use crate::cache_key::CacheKey;
use crate::cache_key::CacheKeyResolver;
use crate::cache_key::QUERY_ROOT;
use crate::cache_key::root_key_for_operation;
use crate::error::NormalizeError;
use crate::operation::FieldKind;
use crate::operation::Fragment;
use crate::operation::Operation;
use crate::operation::ResponseField;
use crate::record::CacheReference;
use crate::record::DependentKey;
use crate::record::FieldValue;
use crate::record::Record;
use crate::record::RecordBuilder;
use crate::record::RecordFieldKey;
use crate::record::RecordSet;
use crate::scalar::ScalarTypeAdapters;

const TYPENAME: &str = "__typename";

/// Builds records from response traversal callbacks.
pub struct ResponseNormalizer<'a> {
    resolver: &'a dyn CacheKeyResolver,
    path_stack: Vec<Vec<String>>,
    record_stack: Vec<RecordBuilder>,
    value_stack: Vec<FieldValue>,
    path: Vec<String>,
    current: RecordBuilder,
    records: RecordSet,
    dependent_keys: HashSet<DependentKey>,
}

impl<'a> ResponseNormalizer<'a> {
    pub fn new(resolver: &'a dyn CacheKeyResolver) -> Self {
        Self {
            resolver,
            path_stack: Vec::new(),
            record_stack: Vec::new(),
            value_stack: Vec::new(),
            path: Vec::new(),
            current: RecordBuilder::new(QUERY_ROOT),
            records: RecordSet::new(),
            dependent_keys: HashSet::new(),
        }
    }

    /// Starts a traversal at the root record of `operation`.
    pub fn will_resolve_root_query(&mut self, operation: &dyn Operation) {
        self.will_resolve_record(root_key_for_operation(operation.kind()));
    }

    /// Starts a traversal at the record `key`, discarding any previous state.
    pub fn will_resolve_record(&mut self, key: &str) {
        self.path_stack.clear();
        self.record_stack.clear();
        self.value_stack.clear();
        self.path.clear();
        if key != QUERY_ROOT {
            self.path.push(key.to_string());
        }
        self.current = RecordBuilder::new(key);
        self.records = RecordSet::new();
        self.dependent_keys.clear();
    }

    pub fn will_resolve(&mut self, field: &ResponseField, variables: &Object) {
        self.path.push(field.cache_key(variables));
    }

    pub fn did_resolve(
        &mut self,
        field: &ResponseField,
        variables: &Object,
    ) -> Result<(), NormalizeError> {
        self.path.pop();
        let value = self.pop_value("did_resolve")?;
        let field_key = field.cache_key(variables);
        self.dependent_keys.insert(DependentKey::Field(RecordFieldKey::new(
            self.current.key(),
            field_key.as_str(),
        )));
        if self.record_stack.is_empty() {
            // top level fields are merged one at a time
            self.records.merge(
                Record::builder(self.current.key())
                    .add_field(field_key, value)
                    .build(),
            );
        } else {
            self.current.insert_field(field_key, value);
        }
        Ok(())
    }

    /// Stores the `__typename` of the current object, which the read path needs to evaluate
    /// type conditions the selection set does not ask `__typename` for.
    pub fn did_resolve_typename(&mut self, typename: &str) {
        if self.record_stack.is_empty() {
            self.records.merge(
                Record::builder(self.current.key())
                    .add_field(TYPENAME, typename)
                    .build(),
            );
        } else {
            self.current.insert_field(TYPENAME.to_string(), typename.into());
        }
    }

    pub fn did_resolve_scalar(&mut self, value: FieldValue) {
        self.value_stack.push(value);
    }

    pub fn will_resolve_object(&mut self, field: &ResponseField, object: Option<&Object>) {
        self.path_stack.push(self.path.clone());
        let cache_key = object
            .map(|object| self.resolver.from_field_record_set(field, object))
            .unwrap_or(CacheKey::NO_KEY);
        let key = if cache_key.is_no_key() {
            self.path.join(".")
        } else {
            self.path = vec![cache_key.key().to_string()];
            cache_key.key().to_string()
        };
        let parent = mem::replace(&mut self.current, RecordBuilder::new(key));
        self.record_stack.push(parent);
    }

    pub fn did_resolve_object(
        &mut self,
        _field: &ResponseField,
        object: Option<&Object>,
    ) -> Result<(), NormalizeError> {
        self.path = self
            .path_stack
            .pop()
            .ok_or_else(|| unbalanced("did_resolve_object without a matching path"))?;
        let parent = self
            .record_stack
            .pop()
            .ok_or_else(|| unbalanced("did_resolve_object without a matching record"))?;
        let completed = mem::replace(&mut self.current, parent);
        if object.is_some() {
            let completed = completed.build();
            self.value_stack
                .push(FieldValue::Reference(CacheReference::new(completed.key())));
            self.dependent_keys
                .insert(DependentKey::Record(completed.key().to_string()));
            self.records.merge(completed);
        }
        Ok(())
    }

    /// Replaces the last `len` values by a list of them, in order.
    pub fn did_resolve_list(&mut self, len: usize) -> Result<(), NormalizeError> {
        let start = self
            .value_stack
            .len()
            .checked_sub(len)
            .ok_or_else(|| unbalanced("did_resolve_list with fewer values than elements"))?;
        let items = self.value_stack.split_off(start);
        self.value_stack.push(FieldValue::List(items));
        Ok(())
    }

    pub fn will_resolve_element(&mut self, index: usize) {
        self.path.push(index.to_string());
    }

    pub fn did_resolve_element(&mut self, _index: usize) {
        self.path.pop();
    }

    pub fn did_resolve_null(&mut self) {
        self.value_stack.push(FieldValue::Null);
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn dependent_keys(&self) -> &HashSet<DependentKey> {
        &self.dependent_keys
    }

    pub fn into_normalized(self) -> Normalized {
        Normalized {
            records: self.records,
            dependent_keys: self.dependent_keys,
        }
    }

    fn pop_value(&mut self, during: &str) -> Result<FieldValue, NormalizeError> {
        self.value_stack
            .pop()
            .ok_or_else(|| unbalanced(&format!("{during} with an empty value stack")))
    }
}

fn unbalanced(reason: &str) -> NormalizeError {
    NormalizeError::UnbalancedTraversal {
        reason: reason.to_string(),
    }
}

/// The output of a normalization pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Normalized {
    pub records: RecordSet,
    pub dependent_keys: HashSet<DependentKey>,
}

/// Walks a JSON response against a selection set and drives a [`ResponseNormalizer`].
pub struct ResponseWriter<'a> {
    variables: &'a Object,
    scalars: &'a ScalarTypeAdapters,
    path: Vec<String>,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(variables: &'a Object, scalars: &'a ScalarTypeAdapters) -> Self {
        Self {
            variables,
            scalars,
            path: Vec::new(),
        }
    }

    pub fn write(
        &mut self,
        normalizer: &mut ResponseNormalizer<'_>,
        selections: &[ResponseField],
        data: &Object,
    ) -> Result<(), NormalizeError> {
        let typename = data.get(TYPENAME).and_then(|typename| typename.as_str());
        if let Some(typename) = typename {
            let conditional = selections.iter().any(ResponseField::is_conditional);
            let selected = selections.iter().any(|field| field.field_name() == TYPENAME);
            if conditional && !selected {
                normalizer.did_resolve_typename(typename);
            }
        }
        for field in selections {
            if !field.applies_to(typename) {
                continue;
            }
            let Some(value) = data.get(field.response_name()) else {
                tracing::warn!(
                    "missing field '{}' at '{}' while normalizing, skipping it",
                    field.response_name(),
                    self.path.join(".")
                );
                continue;
            };
            self.path.push(field.response_name().to_string());
            normalizer.will_resolve(field, self.variables);
            self.write_value(normalizer, field, field.kind(), value)?;
            normalizer.did_resolve(field, self.variables)?;
            self.path.pop();
        }
        Ok(())
    }

    fn write_value(
        &mut self,
        normalizer: &mut ResponseNormalizer<'_>,
        field: &ResponseField,
        kind: &FieldKind,
        value: &Value,
    ) -> Result<(), NormalizeError> {
        match (kind, value) {
            (_, Value::Null) => normalizer.did_resolve_null(),
            (FieldKind::Scalar, value) => {
                normalizer.did_resolve_scalar(FieldValue::from_json(value.clone()))
            }
            (FieldKind::CustomScalar(type_name), value) => {
                let encoded = self.scalars.encode(type_name, value).map_err(|source| {
                    NormalizeError::CustomScalar {
                        path: self.path.join("."),
                        source,
                    }
                })?;
                normalizer.did_resolve_scalar(FieldValue::from_json(encoded));
            }
            (FieldKind::Object(selections), Value::Object(object)) => {
                normalizer.will_resolve_object(field, Some(object));
                self.write(normalizer, selections, object)?;
                normalizer.did_resolve_object(field, Some(object))?;
            }
            (FieldKind::List(inner), Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    self.path.push(index.to_string());
                    normalizer.will_resolve_element(index);
                    self.write_value(normalizer, field, inner, item)?;
                    normalizer.did_resolve_element(index);
                    self.path.pop();
                }
                normalizer.did_resolve_list(items.len())?;
            }
            (kind, value) => {
                return Err(NormalizeError::UnexpectedValue {
                    path: self.path.join("."),
                    expected: kind.describe().to_string(),
                    found: describe(value).to_string(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Normalizes the `data` of a response to `operation`.
pub fn normalize_operation(
    operation: &dyn Operation,
    data: &Object,
    resolver: &dyn CacheKeyResolver,
    scalars: &ScalarTypeAdapters,
) -> Result<Normalized, NormalizeError> {
    let mut normalizer = ResponseNormalizer::new(resolver);
    normalizer.will_resolve_root_query(operation);
    ResponseWriter::new(operation.variables(), scalars).write(
        &mut normalizer,
        operation.selections(),
        data,
    )?;
    Ok(normalizer.into_normalized())
}

/// Normalizes fragment `data` into the record `key`.
pub fn normalize_fragment(
    fragment: &Fragment,
    key: &str,
    variables: &Object,
    data: &Object,
    resolver: &dyn CacheKeyResolver,
    scalars: &ScalarTypeAdapters,
) -> Result<Normalized, NormalizeError> {
    let mut normalizer = ResponseNormalizer::new(resolver);
    normalizer.will_resolve_record(key);
    ResponseWriter::new(variables, scalars).write(&mut normalizer, fragment.selections(), data)?;
    Ok(normalizer.into_normalized())
}
