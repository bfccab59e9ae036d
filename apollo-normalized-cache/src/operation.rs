//! Operation and selection descriptors.
//!
//! A [`ResponseField`] describes one selected field: its response name, the schema field it reads,
//! its arguments, whether it may be null, and the shape of its value. Both the normalizer and the
//! reader walk responses against these descriptors, so the field keys written and read always
//! agree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use sha2::Digest;
use sha2::Sha256;

use crate::Object;
use crate::Value;

/// The kind of a GraphQL operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        })
    }
}

/// A field argument as written in the document.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgumentValue {
    Literal(Value),
    /// A `$variable` reference, by name.
    Variable(String),
    Object(IndexMap<String, ArgumentValue>),
    List(Vec<ArgumentValue>),
}

impl ArgumentValue {
    /// Substitutes variables. A variable missing from `variables` resolves to `null`.
    pub fn resolve(&self, variables: &Object) -> Value {
        match self {
            ArgumentValue::Literal(value) => value.clone(),
            ArgumentValue::Variable(name) => {
                variables.get(name.as_str()).cloned().unwrap_or_default()
            }
            ArgumentValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| {
                        (ByteString::from(name.as_str()), value.resolve(variables))
                    })
                    .collect(),
            ),
            ArgumentValue::List(items) => {
                Value::Array(items.iter().map(|item| item.resolve(variables)).collect())
            }
        }
    }
}

impl From<Value> for ArgumentValue {
    fn from(value: Value) -> Self {
        ArgumentValue::Literal(value)
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        ArgumentValue::Literal(Value::String(value.into()))
    }
}

impl From<i64> for ArgumentValue {
    fn from(value: i64) -> Self {
        ArgumentValue::Literal(Value::Number(value.into()))
    }
}

/// The shape of a field's value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Scalar,
    /// A scalar encoded through the adapter registered for this type name.
    CustomScalar(String),
    /// An object, with its sub-selections.
    Object(Vec<ResponseField>),
    List(Box<FieldKind>),
}

impl FieldKind {
    pub fn list_of(inner: FieldKind) -> Self {
        FieldKind::List(Box::new(inner))
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            FieldKind::Scalar | FieldKind::CustomScalar(_) => "scalar",
            FieldKind::Object(_) => "object",
            FieldKind::List(_) => "list",
        }
    }
}

/// One selected field.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseField {
    response_name: String,
    field_name: String,
    arguments: IndexMap<String, ArgumentValue>,
    optional: bool,
    kind: FieldKind,
    type_conditions: Vec<String>,
}

impl ResponseField {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            response_name: name.to_string(),
            field_name: name.to_string(),
            arguments: IndexMap::new(),
            optional: true,
            kind,
            type_conditions: Vec::new(),
        }
    }

    pub fn scalar(name: &str) -> Self {
        Self::new(name, FieldKind::Scalar)
    }

    pub fn custom_scalar(name: &str, type_name: &str) -> Self {
        Self::new(name, FieldKind::CustomScalar(type_name.to_string()))
    }

    pub fn object(name: &str, selections: Vec<ResponseField>) -> Self {
        Self::new(name, FieldKind::Object(selections))
    }

    pub fn list(name: &str, inner: FieldKind) -> Self {
        Self::new(name, FieldKind::list_of(inner))
    }

    /// Sets the response name, keeping the schema field name.
    pub fn alias(mut self, response_name: &str) -> Self {
        self.response_name = response_name.to_string();
        self
    }

    pub fn argument(mut self, name: &str, value: impl Into<ArgumentValue>) -> Self {
        self.arguments.insert(name.to_string(), value.into());
        self
    }

    /// Marks the field non-null.
    pub fn mandatory(mut self) -> Self {
        self.optional = false;
        self
    }

    /// Restricts the field to objects whose `__typename` is `type_name`.
    ///
    /// A field with several conditions applies when any of them matches.
    pub fn type_condition(mut self, type_name: &str) -> Self {
        self.type_conditions.push(type_name.to_string());
        self
    }

    pub fn response_name(&self) -> &str {
        &self.response_name
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn arguments(&self) -> &IndexMap<String, ArgumentValue> {
        &self.arguments
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// Whether the field is only selected on some types.
    pub fn is_conditional(&self) -> bool {
        !self.type_conditions.is_empty()
    }

    /// Whether the field is selected on an object of the given `__typename`.
    ///
    /// Conditional fields are skipped when the typename is unknown.
    pub fn applies_to(&self, typename: Option<&str>) -> bool {
        self.type_conditions.is_empty()
            || typename.is_some_and(|typename| self.type_conditions.iter().any(|t| t == typename))
    }

    /// Resolves a single argument against the operation variables.
    pub fn resolve_argument(&self, name: &str, variables: &Object) -> Option<Value> {
        self.arguments
            .get(name)
            .map(|value| value.resolve(variables))
    }

    /// The key under which this field is stored in its record.
    ///
    /// `name` without arguments, otherwise `name({...})` with the resolved arguments serialized
    /// as JSON with object keys sorted, so that argument order never changes the key.
    pub fn cache_key(&self, variables: &Object) -> String {
        if self.arguments.is_empty() {
            return self.field_name.clone();
        }
        let arguments: BTreeMap<&str, Value> = self
            .arguments
            .iter()
            .map(|(name, value)| (name.as_str(), sorted(value.resolve(variables))))
            .collect();
        match serde_json::to_string(&arguments) {
            Ok(arguments) => format!("{}({arguments})", self.field_name),
            Err(err) => {
                tracing::warn!("could not serialize arguments of '{}': {err}", self.field_name);
                self.field_name.clone()
            }
        }
    }
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(ByteString, Value)> = object
                .into_iter()
                .map(|(key, value)| (key, sorted(value)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// A GraphQL operation the store can normalize and read back.
pub trait Operation: Send + Sync {
    fn kind(&self) -> OperationKind;

    fn name(&self) -> &str;

    /// The full document text.
    fn document(&self) -> &str;

    /// SHA-256 of the document, hex encoded. Used as the persisted query hash.
    fn operation_id(&self) -> String {
        hex::encode(Sha256::digest(self.document().as_bytes()))
    }

    fn variables(&self) -> &Object;

    fn selections(&self) -> &[ResponseField];
}

impl<O> Operation for Arc<O>
where
    O: Operation + ?Sized,
{
    fn kind(&self) -> OperationKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn document(&self) -> &str {
        (**self).document()
    }

    fn operation_id(&self) -> String {
        (**self).operation_id()
    }

    fn variables(&self) -> &Object {
        (**self).variables()
    }

    fn selections(&self) -> &[ResponseField] {
        (**self).selections()
    }
}

/// An [`Operation`] described at runtime.
#[derive(Clone, Debug)]
pub struct GraphQLOperation {
    kind: OperationKind,
    name: String,
    document: String,
    variables: Object,
    selections: Vec<ResponseField>,
}

#[buildstructor::buildstructor]
impl GraphQLOperation {
    #[builder]
    pub fn new(
        kind: Option<OperationKind>,
        name: String,
        document: String,
        variables: Option<Object>,
        selections: Vec<ResponseField>,
    ) -> Self {
        Self {
            kind: kind.unwrap_or_default(),
            name,
            document,
            variables: variables.unwrap_or_default(),
            selections,
        }
    }
}

impl Operation for GraphQLOperation {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn document(&self) -> &str {
        &self.document
    }

    fn variables(&self) -> &Object {
        &self.variables
    }

    fn selections(&self) -> &[ResponseField] {
        &self.selections
    }
}

/// A fragment, read or written at an arbitrary record.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    type_condition: String,
    selections: Vec<ResponseField>,
}

impl Fragment {
    pub fn new(type_condition: &str, selections: Vec<ResponseField>) -> Self {
        Self {
            type_condition: type_condition.to_string(),
            selections,
        }
    }

    pub fn type_condition(&self) -> &str {
        &self.type_condition
    }

    pub fn selections(&self) -> &[ResponseField] {
        &self.selections
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn variables(value: Value) -> Object {
        match value {
            Value::Object(object) => object,
            _ => Object::default(),
        }
    }

    #[test]
    fn field_keys_without_arguments_are_the_field_name() {
        let field = ResponseField::scalar("name").alias("heroName");
        assert_eq!(field.cache_key(&Object::default()), "name");
        assert_eq!(field.response_name(), "heroName");
    }

    #[test]
    fn field_keys_sort_arguments_and_resolve_variables() {
        let a = ResponseField::object("hero", vec![])
            .argument("episode", ArgumentValue::Variable("episode".into()))
            .argument("filter", json!({ "b": 2, "a": 1 }));
        let b = ResponseField::object("hero", vec![])
            .argument("filter", json!({ "a": 1, "b": 2 }))
            .argument("episode", "JEDI");

        let vars = variables(json!({ "episode": "JEDI" }));
        assert_eq!(
            a.cache_key(&vars),
            r#"hero({"episode":"JEDI","filter":{"a":1,"b":2}})"#
        );
        assert_eq!(a.cache_key(&vars), b.cache_key(&vars));
    }

    #[test]
    fn missing_variables_resolve_to_null() {
        let field = ResponseField::object("hero", vec![])
            .argument("episode", ArgumentValue::Variable("episode".into()));
        assert_eq!(
            field.cache_key(&Object::default()),
            r#"hero({"episode":null})"#
        );
    }

    #[test]
    fn type_conditions() {
        let field = ResponseField::scalar("primaryFunction").type_condition("Droid");
        assert!(field.applies_to(Some("Droid")));
        assert!(!field.applies_to(Some("Human")));
        assert!(!field.applies_to(None));
        assert!(ResponseField::scalar("name").applies_to(None));
    }

    #[test]
    fn operation_id_is_the_document_hash() {
        let operation = GraphQLOperation::builder()
            .name("Hero")
            .document("{hero{name}}")
            .selections(vec![])
            .build();
        assert_eq!(operation.kind(), OperationKind::Query);
        assert_eq!(
            operation.operation_id(),
            hex::encode(Sha256::digest(b"{hero{name}}"))
        );
        assert_eq!(operation.operation_id().len(), 64);
    }
}
