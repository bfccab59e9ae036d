//! The transactional store.
//!
//! [`ApolloStore`] serializes every access to the cache chain behind one reentrant read/write
//! lock, and fans out the fields changed by each write to its subscribers.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use self::dispatcher::Dispatcher;
use self::dispatcher::default_dispatcher;
use self::lock::TransactionLock;
use crate::Object;
use crate::Value;
use crate::cache::CacheHeaders;
use crate::cache::DO_NOT_STORE;
use crate::cache::NormalizedCache;
use crate::cache::memory::EvictionPolicy;
use crate::cache::optimistic::DEFAULT_READ_THROUGH_SIZE;
use crate::cache::optimistic::OptimisticNormalizedCache;
use crate::cache_key::CacheKeyResolver;
use crate::cache_key::NoKeyResolver;
use crate::error::NormalizeError;
use crate::error::ReadError;
use crate::error::StoreError;
use crate::normalizer::Normalized;
use crate::normalizer::normalize_fragment;
use crate::normalizer::normalize_operation;
use crate::operation::Fragment;
use crate::operation::Operation;
use crate::reader::CachedData;
use crate::reader::read_fragment;
use crate::reader::read_operation;
use crate::record::Record;
use crate::record::RecordFieldKey;
use crate::scalar::ScalarTypeAdapters;

pub mod dispatcher;
mod lock;
mod operation;

pub use self::operation::StoreOperation;

/// Notified with the fields changed by each published write.
pub trait StoreSubscriber: Send + Sync {
    fn on_cache_records_changed(&self, changed: &HashSet<RecordFieldKey>);
}

struct StoreInner {
    cache: OptimisticNormalizedCache,
    lock: TransactionLock,
    resolver: Arc<dyn CacheKeyResolver>,
    scalars: ScalarTypeAdapters,
    subscribers: Mutex<Vec<Weak<dyn StoreSubscriber>>>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// The thread-safe façade over the cache chain.
///
/// Cloning is cheap; clones share the same cache, lock and subscribers.
#[derive(Clone)]
pub struct ApolloStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for ApolloStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApolloStore")
            .field("scalars", &self.inner.scalars)
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

/// Builds an [`ApolloStore`] over a durable tier.
pub struct ApolloStoreBuilder {
    durable: Arc<dyn NormalizedCache>,
    resolver: Arc<dyn CacheKeyResolver>,
    scalars: ScalarTypeAdapters,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    optimistic_policy: EvictionPolicy,
}

impl ApolloStoreBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn CacheKeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn scalars(mut self, scalars: ScalarTypeAdapters) -> Self {
        self.scalars = scalars;
        self
    }

    /// Where enqueued operations run. Defaults to the tokio blocking pool of the runtime
    /// calling [`ApolloStoreBuilder::build`], or a thread per operation outside a runtime.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Bounds the read-through LRU of the optimistic tier.
    pub fn optimistic_policy(mut self, policy: EvictionPolicy) -> Self {
        self.optimistic_policy = policy;
        self
    }

    pub fn build(self) -> ApolloStore {
        ApolloStore {
            inner: Arc::new(StoreInner {
                cache: OptimisticNormalizedCache::new(self.durable, self.optimistic_policy),
                lock: TransactionLock::new(),
                resolver: self.resolver,
                scalars: self.scalars,
                subscribers: Mutex::new(Vec::new()),
                dispatcher: self.dispatcher.unwrap_or_else(default_dispatcher),
            }),
        }
    }
}

/// Read access to the cache chain, valid for the duration of a transaction.
pub struct ReadTransaction<'a> {
    store: &'a StoreInner,
}

impl ReadTransaction<'_> {
    pub fn load_record(&self, key: &str, headers: &CacheHeaders) -> Option<Record> {
        self.store.cache.load_record(key, headers)
    }

    /// Reads the response to `operation`. A cache miss is `Ok(None)`.
    pub fn read(
        &self,
        operation: &dyn Operation,
        headers: &CacheHeaders,
    ) -> Result<Option<CachedData>, ReadError> {
        miss_as_none(read_operation(
            operation,
            &self.store.cache,
            headers,
            self.store.resolver.as_ref(),
            &self.store.scalars,
        ))
    }

    /// Reads `fragment` from the record `key`. A cache miss is `Ok(None)`.
    pub fn read_fragment(
        &self,
        fragment: &Fragment,
        key: &str,
        variables: &Object,
        headers: &CacheHeaders,
    ) -> Result<Option<CachedData>, ReadError> {
        miss_as_none(read_fragment(
            fragment,
            key,
            variables,
            &self.store.cache,
            headers,
            self.store.resolver.as_ref(),
            &self.store.scalars,
        ))
    }
}

fn miss_as_none(result: Result<CachedData, ReadError>) -> Result<Option<CachedData>, ReadError> {
    match result {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.is_cache_miss() => {
            tracing::trace!("store read: cache miss: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Exclusive access to the cache chain. Dereferences to a [`ReadTransaction`].
pub struct WriteTransaction<'a> {
    read: ReadTransaction<'a>,
}

impl<'a> Deref for WriteTransaction<'a> {
    type Target = ReadTransaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}

impl WriteTransaction<'_> {
    /// Merges records into every tier and returns the fields that changed.
    pub fn merge(&self, records: Vec<Record>, headers: &CacheHeaders) -> HashSet<RecordFieldKey> {
        if headers.has_header(DO_NOT_STORE) {
            return HashSet::new();
        }
        let changed = self.read.store.cache.merge_all(records, headers);
        tracing::debug!("store merge: {} fields changed", changed.len());
        changed
    }

    /// Applies optimistic patches; each record's version is its mutation id.
    pub fn merge_optimistic(&self, records: Vec<Record>) -> HashSet<RecordFieldKey> {
        self.read.store.cache.merge_optimistic_updates(records)
    }

    pub fn remove_optimistic(&self, mutation_id: Uuid) -> HashSet<RecordFieldKey> {
        self.read.store.cache.remove_optimistic_updates(mutation_id)
    }

    pub fn has_optimistic_updates(&self, key: &str) -> bool {
        self.read.store.cache.has_optimistic_updates(key)
    }

    pub fn remove(&self, key: &str, cascade: bool) -> bool {
        self.read.store.cache.remove(key, cascade)
    }

    pub fn clear_all(&self) {
        self.read.store.cache.clear_all()
    }

    /// Normalizes `data`, the response to `operation`, and merges it.
    pub fn write(
        &self,
        operation: &dyn Operation,
        data: &Object,
        headers: &CacheHeaders,
    ) -> Result<HashSet<RecordFieldKey>, NormalizeError> {
        let normalized = normalize_operation(
            operation,
            data,
            self.read.store.resolver.as_ref(),
            &self.read.store.scalars,
        )?;
        Ok(self.merge(normalized.records.into_records(), headers))
    }

    /// Normalizes fragment `data` into the record `key` and merges it.
    pub fn write_fragment(
        &self,
        fragment: &Fragment,
        key: &str,
        variables: &Object,
        data: &Object,
        headers: &CacheHeaders,
    ) -> Result<HashSet<RecordFieldKey>, NormalizeError> {
        let normalized = normalize_fragment(
            fragment,
            key,
            variables,
            data,
            self.read.store.resolver.as_ref(),
            &self.read.store.scalars,
        )?;
        Ok(self.merge(normalized.records.into_records(), headers))
    }
}

impl ApolloStore {
    /// A store over `durable` with default settings.
    pub fn new(durable: Arc<dyn NormalizedCache>) -> Self {
        Self::builder(durable).build()
    }

    pub fn builder(durable: Arc<dyn NormalizedCache>) -> ApolloStoreBuilder {
        ApolloStoreBuilder {
            durable,
            resolver: Arc::new(NoKeyResolver),
            scalars: ScalarTypeAdapters::new(),
            dispatcher: None,
            optimistic_policy: EvictionPolicy {
                max_size: Some(DEFAULT_READ_THROUGH_SIZE),
                ..Default::default()
            },
        }
    }

    /// Runs `f` holding the store's shared lock.
    pub fn read_transaction<R>(&self, f: impl FnOnce(&ReadTransaction<'_>) -> R) -> R {
        let transaction = ReadTransaction { store: &self.inner };
        self.inner.lock.read(|| f(&transaction))
    }

    /// Runs `f` holding the store's exclusive lock.
    ///
    /// # Panics
    ///
    /// When called inside a read transaction on the same thread.
    pub fn write_transaction<R>(&self, f: impl FnOnce(&WriteTransaction<'_>) -> R) -> R {
        let transaction = WriteTransaction {
            read: ReadTransaction { store: &self.inner },
        };
        self.inner.lock.write(|| f(&transaction))
    }

    /// Normalizes `data` without touching the cache.
    pub fn normalize(
        &self,
        operation: &dyn Operation,
        data: &Object,
    ) -> Result<Normalized, NormalizeError> {
        normalize_operation(
            operation,
            data,
            self.inner.resolver.as_ref(),
            &self.inner.scalars,
        )
    }

    /// Registers `subscriber` without taking ownership of it.
    ///
    /// Dropping the last strong reference is enough to stop notifications.
    pub fn subscribe<S: StoreSubscriber + 'static>(&self, subscriber: &Arc<S>) {
        let subscriber: Arc<dyn StoreSubscriber> = subscriber.clone();
        self.inner
            .subscribers
            .lock()
            .push(Arc::downgrade(&subscriber));
    }

    pub fn unsubscribe<S: StoreSubscriber + 'static>(&self, subscriber: &Arc<S>) {
        self.inner.subscribers.lock().retain(|registered| {
            registered.strong_count() > 0
                && !std::ptr::addr_eq(registered.as_ptr(), Arc::as_ptr(subscriber))
        });
    }

    /// Notifies every live subscriber of `changed`.
    ///
    /// Callbacks run on the calling thread, outside the subscriber table lock, so they may
    /// subscribe or unsubscribe.
    pub fn publish(&self, changed: &HashSet<RecordFieldKey>) {
        if changed.is_empty() {
            return;
        }
        let subscribers: Vec<Arc<dyn StoreSubscriber>> = {
            let mut registered = self.inner.subscribers.lock();
            registered.retain(|subscriber| subscriber.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::trace!(
            "publishing {} changed fields to {} subscribers",
            changed.len(),
            subscribers.len()
        );
        for subscriber in subscribers {
            subscriber.on_cache_records_changed(changed);
        }
    }

    fn operation<T: Send + 'static>(
        &self,
        perform: impl FnOnce(ApolloStore) -> Result<T, StoreError> + Send + 'static,
    ) -> StoreOperation<T> {
        let store = self.clone();
        StoreOperation::new(self.inner.dispatcher.clone(), move || perform(store))
    }

    /// Writes the response to `operation` and returns the changed fields.
    pub fn write(
        &self,
        operation: impl Operation + 'static,
        data: Object,
    ) -> StoreOperation<HashSet<RecordFieldKey>> {
        self.operation(move |store| {
            Ok(store.write_transaction(|tx| {
                tx.write(&operation, &data, &CacheHeaders::none())
            })?)
        })
    }

    /// Writes the response to `operation` and publishes the change. Returns whether anything
    /// changed.
    pub fn write_and_publish(
        &self,
        operation: impl Operation + 'static,
        data: Object,
    ) -> StoreOperation<bool> {
        let write = self.write(operation, data);
        self.operation(move |store| store.publish_outcome(write.execute()))
    }

    /// Writes the response to `operation` as optimistic patches of `mutation_id`.
    pub fn write_optimistic_updates(
        &self,
        operation: impl Operation + 'static,
        data: Object,
        mutation_id: Uuid,
    ) -> StoreOperation<HashSet<RecordFieldKey>> {
        self.operation(move |store| {
            let mut normalized = store.normalize(&operation, &data)?;
            normalized.records.stamp(mutation_id);
            Ok(store.write_transaction(|tx| {
                tx.merge_optimistic(normalized.records.into_records())
            }))
        })
    }

    pub fn write_optimistic_updates_and_publish(
        &self,
        operation: impl Operation + 'static,
        data: Object,
        mutation_id: Uuid,
    ) -> StoreOperation<bool> {
        let write = self.write_optimistic_updates(operation, data, mutation_id);
        self.operation(move |store| store.publish_outcome(write.execute()))
    }

    /// Rolls back the optimistic patches of `mutation_id`, returning the fields they wrote.
    pub fn rollback_optimistic_updates(
        &self,
        mutation_id: Uuid,
    ) -> StoreOperation<HashSet<RecordFieldKey>> {
        self.operation(move |store| {
            Ok(store.write_transaction(|tx| tx.remove_optimistic(mutation_id)))
        })
    }

    pub fn rollback_optimistic_updates_and_publish(
        &self,
        mutation_id: Uuid,
    ) -> StoreOperation<bool> {
        let rollback = self.rollback_optimistic_updates(mutation_id);
        self.operation(move |store| store.publish_outcome(rollback.execute()))
    }

    /// Removes the record `key`, and with `cascade` the records it references.
    pub fn remove(&self, key: impl Into<String>, cascade: bool) -> StoreOperation<bool> {
        let key = key.into();
        self.operation(move |store| Ok(store.write_transaction(|tx| tx.remove(&key, cascade))))
    }

    /// Removes several records, returning how many were present.
    pub fn remove_many(&self, keys: Vec<String>, cascade: bool) -> StoreOperation<usize> {
        self.operation(move |store| {
            Ok(store.write_transaction(|tx| {
                keys.iter().filter(|key| tx.remove(key, cascade)).count()
            }))
        })
    }

    /// Empties every tier, optimistic patches included. Subscribers are not notified.
    pub fn clear_all(&self) -> StoreOperation<bool> {
        self.operation(|store| {
            store.write_transaction(|tx| tx.clear_all());
            Ok(true)
        })
    }

    /// Reads the response to `operation` from the cache. A cache miss is `None`.
    pub fn read(&self, operation: impl Operation + 'static) -> StoreOperation<Option<Object>> {
        self.read_with_headers(operation, CacheHeaders::none())
    }

    pub fn read_with_headers(
        &self,
        operation: impl Operation + 'static,
        headers: CacheHeaders,
    ) -> StoreOperation<Option<Object>> {
        self.operation(move |store| {
            let cached = store.read_transaction(|tx| tx.read(&operation, &headers))?;
            Ok(cached.map(|cached| cached.data))
        })
    }

    /// Reads the response to `operation` and deserializes it into `T`.
    pub fn read_as<T>(&self, operation: impl Operation + 'static) -> StoreOperation<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.operation(move |store| {
            let cached = store.read_transaction(|tx| tx.read(&operation, &CacheHeaders::none()))?;
            cached
                .map(|cached| {
                    serde_json_bytes::from_value(Value::Object(cached.data)).map_err(|e| {
                        StoreError::Deserialize {
                            reason: e.to_string(),
                        }
                    })
                })
                .transpose()
        })
    }

    /// Reads `fragment` from the record `key`. A cache miss is `None`.
    pub fn read_fragment(
        &self,
        fragment: Fragment,
        key: impl Into<String>,
        variables: Object,
    ) -> StoreOperation<Option<Object>> {
        let key = key.into();
        self.operation(move |store| {
            let cached = store.read_transaction(|tx| {
                tx.read_fragment(&fragment, &key, &variables, &CacheHeaders::none())
            })?;
            Ok(cached.map(|cached| cached.data))
        })
    }

    /// Writes fragment `data` into the record `key`.
    pub fn write_fragment(
        &self,
        fragment: Fragment,
        key: impl Into<String>,
        variables: Object,
        data: Object,
    ) -> StoreOperation<HashSet<RecordFieldKey>> {
        let key = key.into();
        self.operation(move |store| {
            Ok(store.write_transaction(|tx| {
                tx.write_fragment(&fragment, &key, &variables, &data, &CacheHeaders::none())
            })?)
        })
    }

    pub fn write_fragment_and_publish(
        &self,
        fragment: Fragment,
        key: impl Into<String>,
        variables: Object,
        data: Object,
    ) -> StoreOperation<bool> {
        let write = self.write_fragment(fragment, key, variables, data);
        self.operation(move |store| store.publish_outcome(write.execute()))
    }

    fn publish_outcome(
        &self,
        outcome: Result<HashSet<RecordFieldKey>, StoreError>,
    ) -> Result<bool, StoreError> {
        let changed = outcome?;
        self.publish(&changed);
        Ok(!changed.is_empty())
    }
}
