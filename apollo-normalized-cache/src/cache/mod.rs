//! Storage tiers for records.
//!
//! Every tier implements [`NormalizedCache`]. Tiers are chained so that a miss in one falls
//! through to the next: an in-memory tier can sit in front of a durable one transparently.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::record::Record;
use crate::record::RecordFieldKey;

pub mod memory;
pub mod optimistic;
pub mod redis;

/// Do not write the records of this request to any tier.
pub const DO_NOT_STORE: &str = "do-not-store";
/// Remove records from the memory tier once they have been read.
pub const EVICT_AFTER_READ: &str = "evict-after-read";
/// Serve expired records instead of treating them as misses.
pub const ALLOW_STALE: &str = "allow-stale";

/// Opaque hints passed unchanged through the cache chain.
///
/// Each tier interprets the headers it knows about and ignores the others.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheHeaders {
    headers: HashMap<String, String>,
}

impl CacheHeaders {
    /// No headers.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn builder() -> CacheHeadersBuilder {
        CacheHeadersBuilder::default()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn to_builder(&self) -> CacheHeadersBuilder {
        CacheHeadersBuilder {
            headers: self.headers.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheHeadersBuilder {
    headers: HashMap<String, String>,
}

impl CacheHeadersBuilder {
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> CacheHeaders {
        CacheHeaders {
            headers: self.headers,
        }
    }
}

/// A record storage tier.
///
/// Implementations must be safe to call from several threads, but the store serializes every
/// call made through it.
pub trait NormalizedCache: Send + Sync {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> Option<Record>;

    /// Loads several records, skipping those that are absent.
    fn load_records(&self, keys: &[String], headers: &CacheHeaders) -> Vec<Record> {
        keys.iter()
            .filter_map(|key| self.load_record(key, headers))
            .collect()
    }

    /// Merges a record field by field and returns the fields that changed.
    fn merge(&self, record: Record, headers: &CacheHeaders) -> HashSet<RecordFieldKey>;

    fn merge_all(&self, records: Vec<Record>, headers: &CacheHeaders) -> HashSet<RecordFieldKey> {
        records
            .into_iter()
            .flat_map(|record| self.merge(record, headers))
            .collect()
    }

    fn clear_all(&self);

    /// Removes a record, and with `cascade` every record reachable from it by reference.
    ///
    /// Returns whether anything was removed.
    fn remove(&self, key: &str, cascade: bool) -> bool;

    /// The tier this one falls through to.
    fn next_cache(&self) -> Option<&Arc<dyn NormalizedCache>> {
        None
    }
}

impl fmt::Debug for dyn NormalizedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NormalizedCache")
    }
}

/// Two tiers acting as one: reads fall through `head` to `next`, writes go to both.
pub struct ChainedCache {
    head: Arc<dyn NormalizedCache>,
    next: Arc<dyn NormalizedCache>,
}

impl ChainedCache {
    pub fn new(head: Arc<dyn NormalizedCache>, next: Arc<dyn NormalizedCache>) -> Self {
        Self { head, next }
    }
}

impl NormalizedCache for ChainedCache {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> Option<Record> {
        if let Some(record) = self.head.load_record(key, headers) {
            return Some(record);
        }
        let record = self.next.load_record(key, headers)?;
        tracing::trace!("cache chain: '{key}' found in next tier");
        if !headers.has_header(DO_NOT_STORE) && !headers.has_header(EVICT_AFTER_READ) {
            self.head.merge(record.clone(), headers);
        }
        Some(record)
    }

    fn merge(&self, record: Record, headers: &CacheHeaders) -> HashSet<RecordFieldKey> {
        let mut changed = self.next.merge(record.clone(), headers);
        changed.extend(self.head.merge(record, headers));
        changed
    }

    fn clear_all(&self) {
        self.head.clear_all();
        self.next.clear_all();
    }

    fn remove(&self, key: &str, cascade: bool) -> bool {
        let head = self.head.remove(key, cascade);
        let next = self.next.remove(key, cascade);
        head || next
    }

    fn next_cache(&self) -> Option<&Arc<dyn NormalizedCache>> {
        Some(&self.next)
    }
}

/// Creates cache tiers.
pub trait NormalizedCacheFactory: Send + Sync {
    fn create(&self) -> Arc<dyn NormalizedCache>;

    /// A factory whose caches fall through to the caches of `next`.
    fn chain(self, next: Arc<dyn NormalizedCacheFactory>) -> ChainedCacheFactory
    where
        Self: Sized + 'static,
    {
        ChainedCacheFactory {
            head: Arc::new(self),
            next,
        }
    }
}

pub struct ChainedCacheFactory {
    head: Arc<dyn NormalizedCacheFactory>,
    next: Arc<dyn NormalizedCacheFactory>,
}

impl NormalizedCacheFactory for ChainedCacheFactory {
    fn create(&self) -> Arc<dyn NormalizedCache> {
        Arc::new(ChainedCache::new(self.head.create(), self.next.create()))
    }
}

/// Composes factories, first to last, into one logical cache.
pub fn create_chain(
    factories: &[Arc<dyn NormalizedCacheFactory>],
) -> Option<Arc<dyn NormalizedCache>> {
    let (last, rest) = factories.split_last()?;
    Some(
        rest.iter()
            .rev()
            .fold(last.create(), |next, factory| {
                Arc::new(ChainedCache::new(factory.create(), next)) as Arc<dyn NormalizedCache>
            }),
    )
}

#[cfg(test)]
mod tests {
    use maplit::hashset;

    use super::memory::EvictionPolicy;
    use super::memory::LruNormalizedCacheFactory;
    use super::*;

    fn factory(max_entries: usize) -> Arc<dyn NormalizedCacheFactory> {
        Arc::new(LruNormalizedCacheFactory::new(EvictionPolicy {
            max_entries: Some(max_entries),
            ..Default::default()
        }))
    }

    fn record(key: &str, name: &str) -> Record {
        Record::builder(key).add_field("name", name).build()
    }

    #[test]
    fn misses_fall_through_and_populate_the_head() {
        let head = factory(10).create();
        let next = factory(10).create();
        next.merge(record("a", "Luke"), &CacheHeaders::none());

        let chain = ChainedCache::new(head.clone(), next.clone());
        assert_eq!(chain.load_record("a", &CacheHeaders::none()), Some(record("a", "Luke")));
        assert_eq!(head.load_record("a", &CacheHeaders::none()), Some(record("a", "Luke")));
        assert!(chain.next_cache().is_some());
    }

    #[test]
    fn do_not_store_skips_read_through() {
        let head = factory(10).create();
        let next = factory(10).create();
        next.merge(record("a", "Luke"), &CacheHeaders::none());

        let chain = ChainedCache::new(head.clone(), next);
        let headers = CacheHeaders::builder().add_header(DO_NOT_STORE, "true").build();
        assert!(chain.load_record("a", &headers).is_some());
        assert!(head.load_record("a", &CacheHeaders::none()).is_none());
    }

    #[test]
    fn merges_and_removes_reach_every_tier() {
        let chain = create_chain(&[factory(10), factory(10), factory(10)]).unwrap();
        let changed = chain.merge(record("a", "Luke"), &CacheHeaders::none());
        assert_eq!(changed, hashset! { RecordFieldKey::new("a", "name") });

        let mut tier = chain.next_cache().cloned();
        let mut depth = 0;
        while let Some(cache) = tier {
            depth += 1;
            tier = cache.next_cache().cloned();
        }
        assert_eq!(depth, 2);

        assert!(chain.remove("a", false));
        assert!(!chain.remove("a", false));
        assert!(chain.load_record("a", &CacheHeaders::none()).is_none());
    }

    #[test]
    fn factories_chain() {
        let factory = LruNormalizedCacheFactory::new(EvictionPolicy::default()).chain(factory(1));
        let cache = factory.create();
        cache.merge(record("a", "Luke"), &CacheHeaders::none());
        cache.clear_all();
        assert!(cache.load_record("a", &CacheHeaders::none()).is_none());
        assert!(create_chain(&[]).is_none());
    }
}
