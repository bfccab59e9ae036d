//! Custom scalar codecs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::Value;
use crate::error::ScalarError;

/// Converts a custom scalar between its response form and its stored form.
pub trait CustomScalarAdapter: Send + Sync {
    /// Response value to stored value.
    fn encode(&self, value: &Value) -> Result<Value, ScalarError>;

    /// Stored value back to response value.
    fn decode(&self, value: &Value) -> Result<Value, ScalarError>;
}

/// Registry of [`CustomScalarAdapter`]s, by scalar type name.
///
/// Scalars without a registered adapter are stored as they appear in the response.
#[derive(Clone, Default)]
pub struct ScalarTypeAdapters {
    adapters: Arc<HashMap<String, Arc<dyn CustomScalarAdapter>>>,
}

impl ScalarTypeAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, type_name: &str, adapter: impl CustomScalarAdapter + 'static) -> Self {
        Arc::make_mut(&mut self.adapters).insert(type_name.to_string(), Arc::new(adapter));
        self
    }

    pub fn adapter_for(&self, type_name: &str) -> Option<&Arc<dyn CustomScalarAdapter>> {
        self.adapters.get(type_name)
    }

    pub(crate) fn encode(&self, type_name: &str, value: &Value) -> Result<Value, ScalarError> {
        match self.adapter_for(type_name) {
            Some(adapter) => adapter.encode(value),
            None => {
                tracing::trace!("no adapter for custom scalar '{type_name}', storing as is");
                Ok(value.clone())
            }
        }
    }

    pub(crate) fn decode(&self, type_name: &str, value: &Value) -> Result<Value, ScalarError> {
        match self.adapter_for(type_name) {
            Some(adapter) => adapter.decode(value),
            None => Ok(value.clone()),
        }
    }
}

impl fmt::Debug for ScalarTypeAdapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.adapters.keys()).finish()
    }
}
