//! Response reconstruction: flat records back into nested responses.

use std::collections::HashSet;

use crate::Object;
use crate::Value;
use crate::cache::CacheHeaders;
use crate::cache::NormalizedCache;
use crate::cache_key::CacheKeyResolver;
use crate::cache_key::root_key_for_operation;
use crate::error::ReadError;
use crate::operation::FieldKind;
use crate::operation::Fragment;
use crate::operation::Operation;
use crate::operation::ResponseField;
use crate::record::CacheReference;
use crate::record::DependentKey;
use crate::record::FieldValue;
use crate::record::Record;
use crate::record::RecordFieldKey;
use crate::scalar::ScalarTypeAdapters;

const TYPENAME: &str = "__typename";

/// Data read from the cache, with the records and fields it depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedData {
    pub data: Object,
    pub dependent_keys: HashSet<DependentKey>,
}

/// Resolves field values from records, loading referenced records through the cache chain.
pub struct CacheFieldValueResolver<'a> {
    cache: &'a dyn NormalizedCache,
    headers: &'a CacheHeaders,
    resolver: &'a dyn CacheKeyResolver,
    variables: &'a Object,
    dependent_keys: HashSet<DependentKey>,
}

impl<'a> CacheFieldValueResolver<'a> {
    pub fn new(
        cache: &'a dyn NormalizedCache,
        headers: &'a CacheHeaders,
        resolver: &'a dyn CacheKeyResolver,
        variables: &'a Object,
    ) -> Self {
        Self {
            cache,
            headers,
            resolver,
            variables,
            dependent_keys: HashSet::new(),
        }
    }

    pub fn load_record(&mut self, key: &str) -> Result<Record, ReadError> {
        self.dependent_keys
            .insert(DependentKey::Record(key.to_string()));
        self.cache
            .load_record(key, self.headers)
            .ok_or_else(|| ReadError::MissingRecord {
                key: key.to_string(),
            })
    }

    /// The value of `field` in `record`.
    ///
    /// Object fields whose arguments resolve to a key are read from that record directly,
    /// whatever `record` holds.
    pub fn value_for(
        &mut self,
        record: &Record,
        field: &ResponseField,
    ) -> Result<FieldValue, ReadError> {
        if let FieldKind::Object(_) = field.kind() {
            let key = self.resolver.from_field_arguments(field, self.variables);
            if !key.is_no_key() {
                return Ok(FieldValue::Reference(CacheReference::new(key.key())));
            }
        }
        let field_key = field.cache_key(self.variables);
        self.dependent_keys
            .insert(DependentKey::Field(RecordFieldKey::new(
                record.key(),
                field_key.as_str(),
            )));
        record
            .field(&field_key)
            .cloned()
            .ok_or_else(|| ReadError::CacheMiss {
                record: record.key().to_string(),
                field: field_key,
            })
    }

    pub fn into_dependent_keys(self) -> HashSet<DependentKey> {
        self.dependent_keys
    }
}

/// Walks a selection set over records and rebuilds the response.
pub struct ResponseReader<'a> {
    values: CacheFieldValueResolver<'a>,
    scalars: &'a ScalarTypeAdapters,
    path: Vec<String>,
}

impl<'a> ResponseReader<'a> {
    pub fn new(values: CacheFieldValueResolver<'a>, scalars: &'a ScalarTypeAdapters) -> Self {
        Self {
            values,
            scalars,
            path: Vec::new(),
        }
    }

    /// Reads `selections` starting at the record `key`.
    pub fn read(
        mut self,
        key: &str,
        selections: &[ResponseField],
    ) -> Result<CachedData, ReadError> {
        let root = self.values.load_record(key)?;
        let data = self.read_object(&root, selections)?;
        Ok(CachedData {
            data,
            dependent_keys: self.values.into_dependent_keys(),
        })
    }

    fn read_object(
        &mut self,
        record: &Record,
        selections: &[ResponseField],
    ) -> Result<Object, ReadError> {
        let typename = match record.field(TYPENAME) {
            Some(FieldValue::Scalar(crate::record::ScalarValue::String(typename))) => {
                Some(typename.as_str())
            }
            _ => None,
        };
        let mut object = Object::default();
        for field in selections {
            if !field.applies_to(typename) {
                continue;
            }
            self.path.push(field.response_name().to_string());
            let value = self.values.value_for(record, field)?;
            let value = self.read_value(field, field.kind(), value, field.is_optional())?;
            object.insert(field.response_name(), value);
            self.path.pop();
        }
        Ok(object)
    }

    fn read_value(
        &mut self,
        field: &ResponseField,
        kind: &FieldKind,
        value: FieldValue,
        nullable: bool,
    ) -> Result<Value, ReadError> {
        match (kind, value) {
            (_, FieldValue::Null) if nullable => Ok(Value::Null),
            (_, FieldValue::Null) => Err(ReadError::MandatoryFieldMissing {
                path: self.path.join("."),
            }),
            (FieldKind::Scalar, value) => value
                .to_json()
                .ok_or_else(|| self.mismatch(kind, "reference")),
            (FieldKind::CustomScalar(type_name), value) => {
                let stored = value
                    .to_json()
                    .ok_or_else(|| self.mismatch(kind, "reference"))?;
                self.scalars
                    .decode(type_name, &stored)
                    .map_err(|e| self.mismatch(kind, &e.to_string()))
            }
            (FieldKind::Object(selections), FieldValue::Reference(reference)) => {
                let record = self.values.load_record(reference.key())?;
                Ok(Value::Object(self.read_object(&record, selections)?))
            }
            (FieldKind::List(inner), FieldValue::List(items)) => {
                let mut values = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    self.path.push(index.to_string());
                    values.push(self.read_value(field, inner, item, true)?);
                    self.path.pop();
                }
                Ok(Value::Array(values))
            }
            (kind, value) => Err(self.mismatch(kind, value.kind())),
        }
    }

    fn mismatch(&self, kind: &FieldKind, found: &str) -> ReadError {
        ReadError::TypeMismatch {
            path: self.path.join("."),
            expected: kind.describe().to_string(),
            found: found.to_string(),
        }
    }
}

/// Reads the response to `operation` from the cache.
pub fn read_operation(
    operation: &dyn Operation,
    cache: &dyn NormalizedCache,
    headers: &CacheHeaders,
    resolver: &dyn CacheKeyResolver,
    scalars: &ScalarTypeAdapters,
) -> Result<CachedData, ReadError> {
    let values = CacheFieldValueResolver::new(cache, headers, resolver, operation.variables());
    ResponseReader::new(values, scalars).read(
        root_key_for_operation(operation.kind()),
        operation.selections(),
    )
}

/// Reads `fragment` from the record `key`.
pub fn read_fragment(
    fragment: &Fragment,
    key: &str,
    variables: &Object,
    cache: &dyn NormalizedCache,
    headers: &CacheHeaders,
    resolver: &dyn CacheKeyResolver,
    scalars: &ScalarTypeAdapters,
) -> Result<CachedData, ReadError> {
    let values = CacheFieldValueResolver::new(cache, headers, resolver, variables);
    ResponseReader::new(values, scalars).read(key, fragment.selections())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::cache::memory::LruNormalizedCache;
    use crate::cache_key::CacheKey;
    use crate::cache_key::NoKeyResolver;
    use crate::normalizer::normalize_operation;
    use crate::normalizer::tests::IdResolver;
    use crate::normalizer::tests::object;
    use crate::operation::ArgumentValue;
    use crate::operation::GraphQLOperation;

    fn hero_query(selections: Vec<ResponseField>) -> GraphQLOperation {
        GraphQLOperation::builder()
            .name("Hero")
            .document("query Hero { hero { ... } }")
            .selections(vec![ResponseField::object("hero", selections)])
            .build()
    }

    fn store(
        operation: &GraphQLOperation,
        data: Value,
        resolver: &dyn CacheKeyResolver,
    ) -> LruNormalizedCache {
        let cache = LruNormalizedCache::default();
        let normalized = normalize_operation(
            operation,
            &object(data),
            resolver,
            &ScalarTypeAdapters::new(),
        )
        .unwrap();
        cache.merge_all(normalized.records.into_records(), &CacheHeaders::none());
        cache
    }

    fn read(
        operation: &GraphQLOperation,
        cache: &LruNormalizedCache,
        resolver: &dyn CacheKeyResolver,
    ) -> Result<CachedData, ReadError> {
        read_operation(
            operation,
            cache,
            &CacheHeaders::none(),
            resolver,
            &ScalarTypeAdapters::new(),
        )
    }

    #[test]
    fn reads_back_what_was_written() {
        let query = hero_query(vec![
            ResponseField::scalar("__typename"),
            ResponseField::scalar("id"),
            ResponseField::scalar("name").alias("heroName"),
            ResponseField::list("appearsIn", FieldKind::Scalar),
            ResponseField::list(
                "friends",
                FieldKind::Object(vec![ResponseField::scalar("id")]),
            ),
            ResponseField::scalar("primaryFunction").type_condition("Droid"),
        ]);
        let data = json!({
            "hero": {
                "__typename": "Droid",
                "id": "2001",
                "heroName": "R2-D2",
                "appearsIn": ["NEWHOPE", "EMPIRE", "JEDI"],
                "friends": [null, { "id": "1000" }, null],
                "primaryFunction": "Astromech"
            }
        });
        let cache = store(&query, data.clone(), &IdResolver);

        let cached = read(&query, &cache, &IdResolver).unwrap();
        assert_eq!(Value::Object(cached.data), data);
        assert!(
            cached
                .dependent_keys
                .contains(&DependentKey::Record("Character:1000".into()))
        );
    }

    #[test]
    fn type_conditions_without_a_selected_typename_read_back() {
        let query = hero_query(vec![
            ResponseField::scalar("name"),
            ResponseField::scalar("primaryFunction").type_condition("Droid"),
            ResponseField::scalar("homePlanet").type_condition("Human"),
        ]);
        let cache = store(
            &query,
            json!({
                "hero": {
                    "__typename": "Droid",
                    "name": "R2-D2",
                    "primaryFunction": "Astromech"
                }
            }),
            &NoKeyResolver,
        );

        let cached = read(&query, &cache, &NoKeyResolver).unwrap();
        assert_eq!(
            Value::Object(cached.data),
            json!({ "hero": { "name": "R2-D2", "primaryFunction": "Astromech" } })
        );
    }

    #[test]
    fn missing_root_and_missing_fields_are_cache_misses() {
        let query = hero_query(vec![ResponseField::scalar("name")]);
        let cache = LruNormalizedCache::default();
        let err = read(&query, &cache, &NoKeyResolver).unwrap_err();
        assert_eq!(err, ReadError::MissingRecord { key: "QUERY_ROOT".into() });
        assert!(err.is_cache_miss());

        let cache = store(&query, json!({ "hero": { "name": "Luke" } }), &NoKeyResolver);
        let wider = hero_query(vec![
            ResponseField::scalar("name"),
            ResponseField::scalar("height"),
        ]);
        let err = read(&wider, &cache, &NoKeyResolver).unwrap_err();
        assert_eq!(
            err,
            ReadError::CacheMiss {
                record: "hero".into(),
                field: "height".into()
            }
        );
    }

    #[test]
    fn dangling_references_are_cache_misses() {
        let query = hero_query(vec![ResponseField::scalar("id")]);
        let cache = store(&query, json!({ "hero": { "id": "1000" } }), &IdResolver);
        cache.remove("Character:1000", false);
        let err = read(&query, &cache, &IdResolver).unwrap_err();
        assert!(err.is_cache_miss());
    }

    #[test]
    fn nulls_in_mandatory_fields_are_hard_errors() {
        let optional = hero_query(vec![ResponseField::scalar("name")]);
        let cache = store(&optional, json!({ "hero": { "name": null } }), &NoKeyResolver);
        let cached = read(&optional, &cache, &NoKeyResolver).unwrap();
        assert_eq!(Value::Object(cached.data), json!({ "hero": { "name": null } }));

        let mandatory = hero_query(vec![ResponseField::scalar("name").mandatory()]);
        let err = read(&mandatory, &cache, &NoKeyResolver).unwrap_err();
        assert_eq!(
            err,
            ReadError::MandatoryFieldMissing {
                path: "hero.name".into()
            }
        );
        assert!(!err.is_cache_miss());
    }

    #[test]
    fn wrong_shapes_are_type_mismatches() {
        let as_scalar = hero_query(vec![ResponseField::scalar("friends")]);
        let cache = store(&as_scalar, json!({ "hero": { "friends": "none" } }), &NoKeyResolver);
        let as_list = hero_query(vec![ResponseField::list(
            "friends",
            FieldKind::Object(vec![ResponseField::scalar("name")]),
        )]);
        let err = read(&as_list, &cache, &NoKeyResolver).unwrap_err();
        assert_eq!(
            err,
            ReadError::TypeMismatch {
                path: "hero.friends".into(),
                expected: "list".into(),
                found: "scalar".into(),
            }
        );
    }

    struct ArgumentResolver;

    impl CacheKeyResolver for ArgumentResolver {
        fn from_field_arguments(&self, field: &ResponseField, variables: &Object) -> CacheKey {
            match field
                .resolve_argument("id", variables)
                .as_ref()
                .and_then(|id| id.as_str())
            {
                Some(id) => CacheKey::new(format!("Character:{id}")),
                None => CacheKey::NO_KEY,
            }
        }
    }

    #[test]
    fn arguments_can_redirect_reads_to_a_record() {
        let cache = LruNormalizedCache::default();
        cache.merge(
            Record::builder("QUERY_ROOT").add_field("other", "x").build(),
            &CacheHeaders::none(),
        );
        cache.merge(
            Record::builder("Character:1002").add_field("name", "Han").build(),
            &CacheHeaders::none(),
        );
        let query = GraphQLOperation::builder()
            .name("Character")
            .document("query Character { character(id: \"1002\") { name } }")
            .selections(vec![
                ResponseField::object("character", vec![ResponseField::scalar("name")])
                    .argument("id", ArgumentValue::from("1002")),
            ])
            .build();
        let cached = read(&query, &cache, &ArgumentResolver).unwrap();
        assert_eq!(
            Value::Object(cached.data),
            json!({ "character": { "name": "Han" } })
        );
    }
}
