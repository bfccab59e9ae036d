//! Cache and store errors.
use displaydoc::Display;
use thiserror::Error;

/// Errors raised while resolving a response back out of the cache.
///
/// [`ReadError::MissingRecord`] and [`ReadError::CacheMiss`] mean the cache does not hold enough
/// data for the read; the store reports them as an absent result. The other variants mean the
/// cached data contradicts the shape the operation expects.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadError {
    /// no record for key '{key}'
    MissingRecord {
        /// The key that could not be loaded.
        key: String,
    },

    /// record '{record}' has no value for field '{field}'
    CacheMiss {
        /// The record that was loaded.
        record: String,
        /// The field key that was never written.
        field: String,
    },

    /// mandatory field '{path}' is null in the cache
    MandatoryFieldMissing {
        /// The response path of the field.
        path: String,
    },

    /// type mismatch at '{path}': expected {expected}, found {found}
    TypeMismatch {
        /// The response path of the value.
        path: String,
        /// The kind of value the operation expects.
        expected: String,
        /// What the cache holds instead.
        found: String,
    },
}

impl ReadError {
    /// Whether this error only means that the cache lacks data for the read.
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            ReadError::MissingRecord { .. } | ReadError::CacheMiss { .. }
        )
    }
}

/// Errors raised while normalizing a response into records.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormalizeError {
    /// unexpected value at '{path}': expected {expected}, found {found}
    UnexpectedValue {
        /// The response path of the value.
        path: String,
        /// The kind of value the selection expects.
        expected: String,
        /// What the response holds instead.
        found: String,
    },

    /// unbalanced normalizer traversal: {reason}
    UnbalancedTraversal {
        /// What went wrong.
        reason: String,
    },

    /// custom scalar at '{path}' could not be encoded: {source}
    CustomScalar {
        /// The response path of the value.
        path: String,
        /// The codec failure.
        source: ScalarError,
    },
}

/// Errors raised by custom scalar codecs.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum ScalarError {
    /// invalid value for custom scalar '{type_name}': {reason}
    InvalidValue {
        /// The custom scalar type.
        type_name: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Errors returned by [`crate::StoreOperation`]s.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// cache read failed: {0}
    Read(#[from] ReadError),

    /// response normalization failed: {0}
    Normalize(#[from] NormalizeError),

    /// cached data could not be deserialized: {reason}
    Deserialize {
        /// The deserializer error.
        reason: String,
    },

    /// store operation was already executed
    OperationAlreadyExecuted,

    /// store operation panicked: {reason}
    OperationPanicked {
        /// The panic payload, when it was a string.
        reason: String,
    },

    /// store operation could not be dispatched: {reason}
    Dispatch {
        /// Why the result never arrived.
        reason: String,
    },
}

/// Configuration errors.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not parse configuration: {0}
    Parse(#[from] serde_yaml::Error),
}
