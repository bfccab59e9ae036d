//! Record identity.

use std::borrow::Cow;
use std::fmt;

use crate::Object;
use crate::operation::OperationKind;
use crate::operation::ResponseField;

/// Key of the record holding the top-level fields of queries.
pub const QUERY_ROOT: &str = "QUERY_ROOT";
/// Key of the record holding the top-level fields of mutations.
pub const MUTATION_ROOT: &str = "MUTATION_ROOT";
/// Key of the record holding the top-level fields of subscriptions.
pub const SUBSCRIPTION_ROOT: &str = "SUBSCRIPTION_ROOT";

/// Root record key for an operation kind.
pub fn root_key_for_operation(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Query => QUERY_ROOT,
        OperationKind::Mutation => MUTATION_ROOT,
        OperationKind::Subscription => SUBSCRIPTION_ROOT,
    }
}

/// The identity used to address a [`crate::Record`].
///
/// [`CacheKey::NO_KEY`] means the object has no stable identity and is addressed by its response
/// path instead.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct CacheKey(Cow<'static, str>);

impl CacheKey {
    pub const NO_KEY: CacheKey = CacheKey(Cow::Borrowed(""));

    pub fn new(key: impl Into<String>) -> Self {
        CacheKey(Cow::Owned(key.into()))
    }

    pub fn key(&self) -> &str {
        &self.0
    }

    pub fn is_no_key(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_key() {
            f.write_str("NO_KEY")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&'static str> for CacheKey {
    fn from(key: &'static str) -> Self {
        CacheKey(Cow::Borrowed(key))
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        CacheKey(Cow::Owned(key))
    }
}

/// Maps fields to record identities.
///
/// Implementations must be pure: the same input always yields the same key. Returning
/// [`CacheKey::NO_KEY`] keeps the object addressed by where it appears in its parent.
pub trait CacheKeyResolver: Send + Sync {
    /// Key for an object found in a response, given its resolved fields.
    fn from_field_record_set(&self, field: &ResponseField, record_set: &Object) -> CacheKey {
        let _ = (field, record_set);
        CacheKey::NO_KEY
    }

    /// Key for an object field, computed from its arguments before any record is loaded.
    ///
    /// Used on reads to jump straight to a record, e.g. `hero(id: "1000")`.
    fn from_field_arguments(&self, field: &ResponseField, variables: &Object) -> CacheKey {
        let _ = (field, variables);
        CacheKey::NO_KEY
    }
}

/// Resolver that never finds an identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoKeyResolver;

impl CacheKeyResolver for NoKeyResolver {}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::operation::ArgumentValue;

    struct IdResolver;

    impl CacheKeyResolver for IdResolver {
        fn from_field_record_set(&self, _field: &ResponseField, record_set: &Object) -> CacheKey {
            match record_set.get("id").and_then(|id| id.as_str()) {
                Some(id) => CacheKey::new(format!("Character:{id}")),
                None => CacheKey::NO_KEY,
            }
        }

        fn from_field_arguments(&self, field: &ResponseField, variables: &Object) -> CacheKey {
            match field.resolve_argument("id", variables) {
                Some(id) => match id.as_str() {
                    Some(id) => CacheKey::new(format!("Character:{id}")),
                    None => CacheKey::NO_KEY,
                },
                None => CacheKey::NO_KEY,
            }
        }
    }

    #[test]
    fn no_key_resolver_never_resolves() {
        let field = ResponseField::object("hero", vec![]);
        let object = json!({ "id": "1000" });
        let object = object.as_object().unwrap();
        assert!(
            NoKeyResolver
                .from_field_record_set(&field, object)
                .is_no_key()
        );
        assert!(
            NoKeyResolver
                .from_field_arguments(&field, object)
                .is_no_key()
        );
    }

    #[test]
    fn argument_keys_are_stable() {
        let field = ResponseField::object("hero", vec![])
            .argument("id", ArgumentValue::Variable("heroId".into()));
        let variables = json!({ "heroId": "1000" });
        let variables = variables.as_object().unwrap();

        let first = IdResolver.from_field_arguments(&field, variables);
        let second = IdResolver.from_field_arguments(&field, variables);
        assert_eq!(first, second);
        assert_eq!(first.key(), "Character:1000");
    }

    #[test]
    fn root_keys() {
        assert_eq!(root_key_for_operation(OperationKind::Query), QUERY_ROOT);
        assert_eq!(
            root_key_for_operation(OperationKind::Mutation),
            MUTATION_ROOT
        );
        assert_eq!(CacheKey::from(QUERY_ROOT).key(), "QUERY_ROOT");
        assert_eq!(CacheKey::NO_KEY.to_string(), "NO_KEY");
    }
}
