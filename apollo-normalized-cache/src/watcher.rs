//! Query watchers: operations re-read from the cache whenever the fields they depend on change.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::Object;
use crate::cache::CacheHeaders;
use crate::error::ReadError;
use crate::operation::Operation;
use crate::record::DependentKey;
use crate::record::RecordFieldKey;
use crate::store::ApolloStore;
use crate::store::StoreSubscriber;

struct WatcherState {
    store: ApolloStore,
    operation: Arc<dyn Operation>,
    headers: CacheHeaders,
    /// `None` after a miss: any change may complete the data.
    dependent_keys: Mutex<Option<HashSet<DependentKey>>>,
    sender: watch::Sender<Option<Object>>,
}

impl WatcherState {
    fn refresh(&self) -> Result<(), ReadError> {
        let cached = self
            .store
            .read_transaction(|tx| tx.read(self.operation.as_ref(), &self.headers))?;
        let data = match cached {
            Some(cached) => {
                *self.dependent_keys.lock() = Some(cached.dependent_keys);
                Some(cached.data)
            }
            None => {
                *self.dependent_keys.lock() = None;
                None
            }
        };
        self.sender.send_if_modified(|current| {
            if *current == data {
                false
            } else {
                *current = data;
                true
            }
        });
        Ok(())
    }
}

impl StoreSubscriber for WatcherState {
    fn on_cache_records_changed(&self, changed: &HashSet<RecordFieldKey>) {
        let affected = match &*self.dependent_keys.lock() {
            Some(dependent_keys) => changed
                .iter()
                .any(|field| dependent_keys.iter().any(|key| key.is_affected_by(field))),
            None => true,
        };
        if !affected {
            return;
        }
        tracing::trace!("watcher: refreshing '{}'", self.operation.name());
        if let Err(e) = self.refresh() {
            tracing::warn!(
                "watcher: could not re-read '{}' from the cache: {e}",
                self.operation.name()
            );
        }
    }
}

/// Watches the cached response to an operation.
///
/// The watcher subscribes to its store and unsubscribes when dropped. Changes must be published
/// outside of any transaction, since the watcher re-reads the cache while notified.
pub struct QueryWatcher {
    state: Arc<WatcherState>,
    receiver: watch::Receiver<Option<Object>>,
}

impl QueryWatcher {
    /// Reads `operation` once and starts watching it.
    pub fn new(store: &ApolloStore, operation: Arc<dyn Operation>) -> Result<Self, ReadError> {
        Self::with_headers(store, operation, CacheHeaders::none())
    }

    pub fn with_headers(
        store: &ApolloStore,
        operation: Arc<dyn Operation>,
        headers: CacheHeaders,
    ) -> Result<Self, ReadError> {
        let (sender, receiver) = watch::channel(None);
        let state = Arc::new(WatcherState {
            store: store.clone(),
            operation,
            headers,
            dependent_keys: Mutex::new(None),
            sender,
        });
        state.refresh()?;
        store.subscribe(&state);
        Ok(Self { state, receiver })
    }

    /// The latest data read, `None` while the cache cannot answer the operation.
    pub fn current(&self) -> Option<Object> {
        self.receiver.borrow().clone()
    }

    /// Waits for the data to change and returns it.
    pub async fn changed(&mut self) -> Option<Object> {
        // the sender lives as long as the watcher
        let _ = self.receiver.changed().await;
        self.receiver.borrow_and_update().clone()
    }

    /// The records and fields the latest data was read from.
    pub fn dependent_keys(&self) -> HashSet<DependentKey> {
        self.state
            .dependent_keys
            .lock()
            .clone()
            .unwrap_or_default()
    }
}

impl Drop for QueryWatcher {
    fn drop(&mut self) {
        self.state.store.unsubscribe(&self.state);
    }
}
