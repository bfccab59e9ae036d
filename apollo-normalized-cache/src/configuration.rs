//! Cache and pipeline configuration.

use std::str::FromStr;
use std::sync::Arc;

use bytesize::ByteSize;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::cache::NormalizedCache;
use crate::cache::memory::EvictionPolicy;
use crate::cache::memory::LruNormalizedCache;
use crate::cache::optimistic::DEFAULT_READ_THROUGH_SIZE;
use crate::error::ConfigurationError;
use crate::pipeline::FetchPolicy;
use crate::store::ApolloStore;
use crate::store::ApolloStoreBuilder;

/// The configuration of a normalized cache and the pipeline in front of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Cache tiers.
    pub cache: Cache,

    /// Automatic persisted queries.
    pub persisted_queries: PersistedQueries,

    /// The fetch policy of requests that do not set one.
    pub fetch_policy: FetchPolicy,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Cache {
    /// The in-memory tier.
    pub memory: EvictionPolicy,

    /// The optimistic tier.
    pub optimistic: Optimistic,
}

/// Optimistic tier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Optimistic {
    /// Bound on the records the optimistic tier keeps after reading them from the tiers below.
    #[schemars(with = "String")]
    pub max_size: ByteSize,
}

impl Default for Optimistic {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_READ_THROUGH_SIZE,
        }
    }
}

/// Automatic persisted queries configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct PersistedQueries {
    /// Send the hash of the document instead of the document, falling back to the document when
    /// the server does not know the hash.
    pub enabled: bool,
}

impl Default for PersistedQueries {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[buildstructor::buildstructor]
impl Configuration {
    #[builder]
    pub fn new(
        memory: Option<EvictionPolicy>,
        optimistic_max_size: Option<ByteSize>,
        persisted_queries: Option<bool>,
        fetch_policy: Option<FetchPolicy>,
    ) -> Self {
        Self {
            cache: Cache {
                memory: memory.unwrap_or_default(),
                optimistic: Optimistic {
                    max_size: optimistic_max_size.unwrap_or(DEFAULT_READ_THROUGH_SIZE),
                },
            },
            persisted_queries: PersistedQueries {
                enabled: persisted_queries.unwrap_or(true),
            },
            fetch_policy: fetch_policy.unwrap_or_default(),
        }
    }

    /// Parses a YAML configuration.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The JSON schema of the YAML configuration.
    pub fn schema() -> RootSchema {
        let settings = SchemaSettings::draft07().with(|s| {
            s.option_nullable = true;
            s.option_add_null_type = false;
            s.inline_subschemas = true;
        });
        settings.into_generator().into_root_schema_for::<Configuration>()
    }

    /// A memory tier bounded by `cache.memory`.
    pub fn memory_cache(&self) -> Arc<dyn NormalizedCache> {
        Arc::new(LruNormalizedCache::new(self.cache.memory.clone()))
    }

    /// A store builder over `durable`, with the optimistic tier bounded by
    /// `cache.optimistic.max_size`.
    pub fn store_builder(&self, durable: Arc<dyn NormalizedCache>) -> ApolloStoreBuilder {
        ApolloStore::builder(durable).optimistic_policy(EvictionPolicy {
            max_size: Some(self.cache.optimistic.max_size),
            ..Default::default()
        })
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml(s)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let configuration = Configuration::from_yaml("{}").unwrap();
        assert_eq!(configuration, Configuration::default());
        assert!(configuration.persisted_queries.enabled);
        assert_eq!(configuration.fetch_policy, FetchPolicy::CacheFirst);
        assert_eq!(configuration.cache.optimistic.max_size, ByteSize::mib(5));
        assert_eq!(configuration, Configuration::builder().build());
    }

    #[test]
    fn full_configuration() {
        let configuration: Configuration = r#"
cache:
  memory:
    max_size: 10MB
    expire_after_access: 5m
  optimistic:
    max_size: 1MB
persisted_queries:
  enabled: false
fetch_policy: network_first
"#
        .parse()
        .unwrap();
        assert_eq!(
            configuration,
            Configuration::builder()
                .memory(EvictionPolicy {
                    max_size: Some(ByteSize::mb(10)),
                    expire_after_access: Some(Duration::from_secs(300)),
                    ..Default::default()
                })
                .optimistic_max_size(ByteSize::mb(1))
                .persisted_queries(false)
                .fetch_policy(FetchPolicy::NetworkFirst)
                .build()
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = Configuration::from_yaml("cache:\n  disk: {}\n").unwrap_err();
        assert!(error.to_string().contains("unknown field `disk`"), "{error}");
    }

    #[test]
    fn schema() {
        let schema = serde_json::to_value(Configuration::schema()).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert_eq!(
            properties.keys().collect::<Vec<_>>(),
            vec!["cache", "fetch_policy", "persisted_queries"]
        );
    }

    #[test]
    fn store_builder_bounds_the_optimistic_tier() {
        let configuration = Configuration::builder()
            .optimistic_max_size(ByteSize::kb(1))
            .build();
        let store = configuration
            .store_builder(configuration.memory_cache())
            .dispatcher(Arc::new(crate::store::dispatcher::InlineDispatcher))
            .build();
        assert!(store.read_transaction(|tx| {
            tx.load_record("QUERY_ROOT", &crate::cache::CacheHeaders::none())
                .is_none()
        }));
    }
}
