//! Bounded in-memory cache tier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytesize::ByteSize;
use lru::LruCache;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use super::ALLOW_STALE;
use super::CacheHeaders;
use super::EVICT_AFTER_READ;
use super::NormalizedCache;
use super::NormalizedCacheFactory;
use crate::record::Record;
use crate::record::RecordFieldKey;

/// Bounds of an in-memory tier. Unset bounds are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct EvictionPolicy {
    /// Maximum total weight of the held records, e.g. `10MB`.
    #[schemars(with = "Option<String>")]
    pub max_size: Option<ByteSize>,

    /// Maximum number of held records.
    pub max_entries: Option<usize>,

    /// Records older than this are misses, unless the read allows stale data.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub expire_after_write: Option<Duration>,

    /// Records not read for this long are misses, unless the read allows stale data.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub expire_after_access: Option<Duration>,
}

impl EvictionPolicy {
    /// Whether neither the size nor the entry count is bounded.
    pub fn is_unbounded(&self) -> bool {
        self.max_size.is_none() && self.max_entries.is_none()
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        self.expire_after_write
            .is_some_and(|ttl| now.duration_since(entry.written) > ttl)
            || self
                .expire_after_access
                .is_some_and(|ttl| now.duration_since(entry.accessed) > ttl)
    }
}

struct Entry {
    record: Record,
    written: Instant,
    accessed: Instant,
}

/// An LRU map of records, bounded by an [`EvictionPolicy`].
///
/// The weight of a record is its size estimate. Not synchronized: callers hold it in a lock.
pub(crate) struct RecordLru {
    entries: LruCache<String, Entry>,
    weight: usize,
    policy: EvictionPolicy,
}

impl RecordLru {
    pub(crate) fn new(policy: EvictionPolicy) -> Self {
        Self {
            entries: LruCache::unbounded(),
            weight: 0,
            policy,
        }
    }

    pub(crate) fn get(&mut self, key: &str, allow_stale: bool) -> Option<&Record> {
        let now = Instant::now();
        let expired = self
            .entries
            .peek(key)
            .map(|entry| self.policy.is_expired(entry, now))?;
        if expired && !allow_stale {
            tracing::trace!("'{key}' expired");
            self.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.accessed = now;
        Some(&entry.record)
    }

    /// Replaces any record held under the same key.
    pub(crate) fn insert(&mut self, record: Record) {
        let now = Instant::now();
        self.weight += record.size_estimate();
        let entry = Entry {
            record,
            written: now,
            accessed: now,
        };
        if let Some(previous) = self.entries.put(entry.record.key().to_string(), entry) {
            self.weight = self.weight.saturating_sub(previous.record.size_estimate());
        }
        self.trim();
    }

    pub(crate) fn merge(&mut self, record: Record) -> HashSet<RecordFieldKey> {
        let now = Instant::now();
        let changed = match self.entries.get_mut(record.key()) {
            Some(entry) => {
                let before = entry.record.size_estimate();
                let changed = entry.record.merge_with(&record);
                entry.written = now;
                entry.accessed = now;
                self.weight = (self.weight + entry.record.size_estimate()).saturating_sub(before);
                changed
            }
            None => {
                let changed = record.field_keys();
                self.weight += record.size_estimate();
                self.entries.put(
                    record.key().to_string(),
                    Entry {
                        record,
                        written: now,
                        accessed: now,
                    },
                );
                changed
            }
        };
        self.trim();
        changed
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Record> {
        let entry = self.entries.pop(key)?;
        self.weight = self.weight.saturating_sub(entry.record.size_estimate());
        Some(entry.record)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.weight = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn weight(&self) -> usize {
        self.weight
    }

    fn over_capacity(&self) -> bool {
        self.policy
            .max_entries
            .is_some_and(|max| self.entries.len() > max)
            || self
                .policy
                .max_size
                .is_some_and(|max| self.weight as u64 > max.as_u64())
    }

    fn trim(&mut self) {
        while self.over_capacity() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            tracing::trace!("evicting '{key}'");
            self.weight = self.weight.saturating_sub(entry.record.size_estimate());
        }
    }
}

/// In-memory [`NormalizedCache`] evicting least recently used records.
pub struct LruNormalizedCache {
    lru: Mutex<RecordLru>,
}

impl LruNormalizedCache {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            lru: Mutex::new(RecordLru::new(policy)),
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of the records held, in estimated bytes.
    pub fn weight(&self) -> usize {
        self.lru.lock().weight()
    }
}

impl Default for LruNormalizedCache {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

impl NormalizedCache for LruNormalizedCache {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> Option<Record> {
        let mut lru = self.lru.lock();
        let record = lru.get(key, headers.has_header(ALLOW_STALE)).cloned();
        match &record {
            Some(_) if headers.has_header(EVICT_AFTER_READ) => {
                lru.remove(key);
            }
            Some(_) => tracing::trace!("memory cache hit for '{key}'"),
            None => tracing::trace!("memory cache miss for '{key}'"),
        }
        record
    }

    fn merge(&self, record: Record, _headers: &CacheHeaders) -> HashSet<RecordFieldKey> {
        self.lru.lock().merge(record)
    }

    fn clear_all(&self) {
        self.lru.lock().clear();
    }

    fn remove(&self, key: &str, cascade: bool) -> bool {
        let mut lru = self.lru.lock();
        let mut removed = false;
        let mut pending = vec![key.to_string()];
        let mut visited = HashSet::new();
        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(record) = lru.remove(&key) {
                removed = true;
                if cascade {
                    pending.extend(record.references().iter().map(|r| r.key().to_string()));
                }
            }
        }
        removed
    }
}

/// Creates [`LruNormalizedCache`]s sharing one eviction policy.
#[derive(Clone, Debug, Default)]
pub struct LruNormalizedCacheFactory {
    policy: EvictionPolicy,
}

impl LruNormalizedCacheFactory {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }
}

impl NormalizedCacheFactory for LruNormalizedCacheFactory {
    fn create(&self) -> Arc<dyn NormalizedCache> {
        Arc::new(LruNormalizedCache::new(self.policy.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CacheReference;
    use crate::record::FieldValue;

    fn record(key: &str) -> Record {
        Record::builder(key).add_field("name", key).build()
    }

    #[test]
    fn evicts_least_recently_used_entries() {
        let cache = LruNormalizedCache::new(EvictionPolicy {
            max_entries: Some(2),
            ..Default::default()
        });
        let headers = CacheHeaders::none();
        cache.merge(record("a"), &headers);
        cache.merge(record("b"), &headers);
        // touch a so that b is the least recently used
        assert!(cache.load_record("a", &headers).is_some());
        cache.merge(record("c"), &headers);

        assert_eq!(cache.len(), 2);
        assert!(cache.load_record("b", &headers).is_none());
        assert!(cache.load_record("a", &headers).is_some());
    }

    #[test]
    fn weight_bounds_the_cache() {
        let one = record("a").size_estimate();
        let cache = LruNormalizedCache::new(EvictionPolicy {
            max_size: Some(ByteSize::b((one * 2) as u64)),
            ..Default::default()
        });
        let headers = CacheHeaders::none();
        cache.merge(record("a"), &headers);
        cache.merge(record("b"), &headers);
        assert_eq!(cache.weight(), one * 2);
        cache.merge(record("c"), &headers);
        assert_eq!(cache.len(), 2);
        assert!(cache.weight() <= one * 2);
    }

    #[test]
    fn weight_follows_merges() {
        let cache = LruNormalizedCache::default();
        let headers = CacheHeaders::none();
        cache.merge(record("a"), &headers);
        cache.merge(
            Record::builder("a").add_field("bio", "a long biography").build(),
            &headers,
        );
        let merged = cache.load_record("a", &headers).unwrap();
        assert_eq!(cache.weight(), merged.to_builder().build().size_estimate());

        cache.remove("a", false);
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn expired_records_are_misses_unless_stale_is_allowed() {
        let cache = LruNormalizedCache::new(EvictionPolicy {
            expire_after_write: Some(Duration::ZERO),
            ..Default::default()
        });
        cache.merge(record("a"), &CacheHeaders::none());
        std::thread::sleep(Duration::from_millis(2));

        let stale = CacheHeaders::builder().add_header(ALLOW_STALE, "true").build();
        assert!(cache.load_record("a", &stale).is_some());
        assert!(cache.load_record("a", &CacheHeaders::none()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_after_read() {
        let cache = LruNormalizedCache::default();
        cache.merge(record("a"), &CacheHeaders::none());
        let headers = CacheHeaders::builder()
            .add_header(EVICT_AFTER_READ, "true")
            .build();
        assert!(cache.load_record("a", &headers).is_some());
        assert!(cache.load_record("a", &headers).is_none());
    }

    #[test]
    fn cascade_removal_follows_references_and_survives_cycles() {
        let cache = LruNormalizedCache::default();
        let headers = CacheHeaders::none();
        cache.merge(
            Record::builder("Character:1000")
                .add_field(
                    "friends",
                    FieldValue::List(vec![CacheReference::new("Character:1002").into()]),
                )
                .build(),
            &headers,
        );
        cache.merge(
            Record::builder("Character:1002")
                .add_field(
                    "friends",
                    FieldValue::List(vec![CacheReference::new("Character:1000").into()]),
                )
                .build(),
            &headers,
        );
        cache.merge(record("Character:2001"), &headers);

        assert!(cache.remove("Character:1000", true));
        assert_eq!(cache.len(), 1);
        assert!(!cache.remove("Character:1000", true));
    }

    #[test]
    fn policies_deserialize_from_yaml() {
        let policy: EvictionPolicy = serde_yaml::from_str(
            "max_size: 10MB\nmax_entries: 100\nexpire_after_write: 30s\n",
        )
        .unwrap();
        assert_eq!(policy.max_size, Some(ByteSize::mb(10)));
        assert_eq!(policy.max_entries, Some(100));
        assert_eq!(policy.expire_after_write, Some(Duration::from_secs(30)));
        assert_eq!(policy.expire_after_access, None);
    }
}
