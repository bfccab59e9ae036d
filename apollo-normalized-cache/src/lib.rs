//! A normalized GraphQL response cache.
//!
//! Responses are flattened into [`Record`]s addressed by [`CacheKey`], merged into a chain of
//! [`NormalizedCache`] tiers fronted by an [`OptimisticNormalizedCache`], and served back through
//! the transactional [`ApolloStore`]. The [`pipeline`] module wires the store into a tower stack
//! that implements fetch policies and persisted query negotiation.

#![warn(unreachable_pub)]

pub mod cache;
pub mod cache_key;
pub mod configuration;
pub mod error;
pub mod graphql;
pub mod normalizer;
pub mod operation;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod scalar;
mod size_estimation;
pub mod store;
pub mod watcher;

pub use cache::CacheHeaders;
pub use cache::NormalizedCache;
pub use cache::memory::LruNormalizedCache;
pub use cache::optimistic::OptimisticNormalizedCache;
pub use cache_key::CacheKey;
pub use cache_key::CacheKeyResolver;
pub use configuration::Configuration;
pub use operation::Fragment;
pub use operation::GraphQLOperation;
pub use operation::Operation;
pub use operation::OperationKind;
pub use operation::ResponseField;
pub use record::CacheReference;
pub use record::DependentKey;
pub use record::FieldValue;
pub use record::Record;
pub use record::RecordFieldKey;
pub use record::RecordSet;
pub use store::ApolloStore;
pub use store::StoreOperation;

/// A JSON value, as found in GraphQL responses and variables.
pub type Value = serde_json_bytes::Value;

/// A JSON object.
pub type Object = serde_json_bytes::Map<serde_json_bytes::ByteString, Value>;
