//! Optimistic overlay over a cache tier.
//!
//! Optimistic patches live in per-key journals, entirely apart from the delegate tier. Reads
//! overlay the journal snapshot on top of the delegate record, so rolling back a mutation only
//! has to rebuild the journals it touched.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use bytesize::ByteSize;
use parking_lot::Mutex;
use uuid::Uuid;

use super::CacheHeaders;
use super::DO_NOT_STORE;
use super::EVICT_AFTER_READ;
use super::NormalizedCache;
use super::memory::EvictionPolicy;
use super::memory::RecordLru;
use crate::record::Record;
use crate::record::RecordFieldKey;

/// Bound on the read-through LRU when the configured policy bounds neither size nor entries.
pub const DEFAULT_READ_THROUGH_SIZE: ByteSize = ByteSize::mib(5);

/// The optimistic patches applied to one record key, oldest first.
struct RecordJournal {
    snapshot: Record,
    history: Vec<Record>,
}

impl RecordJournal {
    fn new(patch: Record) -> Self {
        Self {
            snapshot: patch.clone(),
            history: vec![patch],
        }
    }

    fn latest_version(&self) -> Option<Uuid> {
        self.history.iter().rev().find_map(Record::version)
    }

    fn commit(&mut self, patch: Record) -> HashSet<RecordFieldKey> {
        let changed = self.snapshot.merge_with(&patch);
        self.history.push(patch);
        changed
    }

    /// Drops the patches of `mutation_id` and replays the others.
    ///
    /// Returns every field the dropped patches wrote.
    fn revert(&mut self, mutation_id: Uuid) -> HashSet<RecordFieldKey> {
        let (reverted, kept): (Vec<Record>, Vec<Record>) = self
            .history
            .drain(..)
            .partition(|patch| patch.version() == Some(mutation_id));
        self.history = kept;
        if !reverted.is_empty() {
            if let Some((first, rest)) = self.history.split_first() {
                let mut snapshot = first.clone();
                for patch in rest {
                    snapshot.merge_with(patch);
                }
                self.snapshot = snapshot;
            }
        }
        reverted.iter().flat_map(Record::field_keys).collect()
    }

    fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

struct OptimisticState {
    journals: HashMap<String, RecordJournal>,
    read_through: RecordLru,
}

/// A [`NormalizedCache`] layering optimistic patches, tagged by mutation id, over a delegate.
///
/// Records loaded from the delegate are kept in a bounded read-through LRU. Evicting from it
/// only costs a reload. A policy without a size or entry bound is capped at
/// [`DEFAULT_READ_THROUGH_SIZE`].
pub struct OptimisticNormalizedCache {
    delegate: Arc<dyn NormalizedCache>,
    state: Mutex<OptimisticState>,
}

impl OptimisticNormalizedCache {
    pub fn new(delegate: Arc<dyn NormalizedCache>, mut read_through: EvictionPolicy) -> Self {
        if read_through.is_unbounded() {
            read_through.max_size = Some(DEFAULT_READ_THROUGH_SIZE);
        }
        Self {
            delegate,
            state: Mutex::new(OptimisticState {
                journals: HashMap::new(),
                read_through: RecordLru::new(read_through),
            }),
        }
    }

    /// Applies an optimistic patch. The patch's version is its mutation id.
    ///
    /// A patch without a version inherits the version of the latest patch applied to that key.
    /// With no earlier patch nothing could ever roll it back, so it is rejected and changes
    /// nothing.
    pub fn merge_optimistic_update(&self, record: Record) -> HashSet<RecordFieldKey> {
        let mut state = self.state.lock();
        match state.journals.entry(record.key().to_string()) {
            Entry::Occupied(mut journal) => {
                let record = match record.version() {
                    Some(_) => record,
                    None => record
                        .to_builder()
                        .version(journal.get().latest_version())
                        .build(),
                };
                journal.get_mut().commit(record)
            }
            Entry::Vacant(_) if record.version().is_none() => {
                tracing::warn!(
                    "rejected optimistic patch of '{}' without a mutation id",
                    record.key()
                );
                HashSet::new()
            }
            Entry::Vacant(journal) => {
                let changed = record.field_keys();
                journal.insert(RecordJournal::new(record));
                changed
            }
        }
    }

    pub fn merge_optimistic_updates(&self, records: Vec<Record>) -> HashSet<RecordFieldKey> {
        records
            .into_iter()
            .flat_map(|record| self.merge_optimistic_update(record))
            .collect()
    }

    /// Rolls back every patch of `mutation_id`, returning the fields those patches wrote.
    pub fn remove_optimistic_updates(&self, mutation_id: Uuid) -> HashSet<RecordFieldKey> {
        let mut state = self.state.lock();
        let mut changed = HashSet::new();
        state.journals.retain(|_, journal| {
            changed.extend(journal.revert(mutation_id));
            !journal.is_empty()
        });
        tracing::debug!(
            "rolled back mutation {mutation_id}: {} fields changed",
            changed.len()
        );
        changed
    }

    /// Whether optimistic patches are held for `key`.
    pub fn has_optimistic_updates(&self, key: &str) -> bool {
        self.state.lock().journals.contains_key(key)
    }

    fn load_base(&self, key: &str, headers: &CacheHeaders) -> Option<Record> {
        if let Some(record) = self.state.lock().read_through.get(key, true) {
            return Some(record.clone());
        }
        let record = self.delegate.load_record(key, headers)?;
        if !headers.has_header(DO_NOT_STORE) && !headers.has_header(EVICT_AFTER_READ) {
            self.state.lock().read_through.insert(record.clone());
        }
        Some(record)
    }
}

impl NormalizedCache for OptimisticNormalizedCache {
    fn load_record(&self, key: &str, headers: &CacheHeaders) -> Option<Record> {
        let base = self.load_base(key, headers);
        let state = self.state.lock();
        match (base, state.journals.get(key)) {
            (Some(mut base), Some(journal)) => {
                base.merge_with(&journal.snapshot);
                Some(base)
            }
            (None, Some(journal)) => Some(journal.snapshot.clone()),
            (base, None) => base,
        }
    }

    fn merge(&self, record: Record, headers: &CacheHeaders) -> HashSet<RecordFieldKey> {
        let key = record.key().to_string();
        let changed = self.delegate.merge(record, headers);
        self.state.lock().read_through.remove(&key);
        changed
    }

    fn clear_all(&self) {
        {
            let mut state = self.state.lock();
            state.journals.clear();
            state.read_through.clear();
        }
        self.delegate.clear_all();
    }

    fn remove(&self, key: &str, cascade: bool) -> bool {
        let mut removed = false;
        let mut pending = vec![key.to_string()];
        let mut visited = HashSet::new();
        while let Some(key) = pending.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if cascade {
                if let Some(record) = self.load_record(&key, &CacheHeaders::none()) {
                    pending.extend(record.references().iter().map(|r| r.key().to_string()));
                }
            }
            let held = {
                let mut state = self.state.lock();
                let journal = state.journals.remove(&key).is_some();
                let cached = state.read_through.remove(&key).is_some();
                journal || cached
            };
            let delegated = self.delegate.remove(&key, false);
            removed |= held || delegated;
        }
        removed
    }

    fn next_cache(&self) -> Option<&Arc<dyn NormalizedCache>> {
        Some(&self.delegate)
    }
}
