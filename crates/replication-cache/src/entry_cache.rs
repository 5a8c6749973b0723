//! Bounded LRU cache of record state keyed by record id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{RecordId, TypeId};
use parking_lot::Mutex;
use record_store::{Attributes, DecodedRow, RecordView};
use serde::Serialize;

/// Cached state of one record.
///
/// Entries are immutable once inserted and shared between concurrent
/// readers; readers copy the attributes before handing them out.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub type_id: TypeId,
    pub payload: Arc<[u8]>,
    pub values: Attributes,
}

impl CacheEntry {
    /// Borrows this entry as a record view for the given id.
    pub fn view(&self, id: RecordId) -> RecordView<'_> {
        RecordView {
            id,
            type_id: self.type_id,
            payload: &self.payload,
            values: &self.values,
        }
    }
}

impl From<DecodedRow> for CacheEntry {
    fn from(row: DecodedRow) -> Self {
        Self {
            type_id: row.type_id,
            payload: row.payload,
            values: row.values,
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Thread-safe, size-bounded LRU cache of [`CacheEntry`] values.
///
/// The lock is held only for the duration of a single map operation and
/// never across an `.await`.
pub struct EntryCache {
    capacity: usize,
    inner: Mutex<LruInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct LruInner {
    entries: HashMap<RecordId, Slot>,
    /// Recency index: lowest tick is the least recently used.
    recency: BTreeMap<u64, RecordId>,
    tick: u64,
}

struct Slot {
    entry: Arc<CacheEntry>,
    tick: u64,
}

impl LruInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: &RecordId) -> Option<Arc<CacheEntry>> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(id)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        self.recency.insert(tick, *id);
        Some(Arc::clone(&slot.entry))
    }
}

impl EntryCache {
    /// Creates a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(LruInner {
                entries: HashMap::with_capacity(capacity.min(1 << 16)),
                recency: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Looks up an entry, marking it most recently used.
    pub fn get(&self, id: &RecordId) -> Option<Arc<CacheEntry>> {
        let found = self.inner.lock().touch(id);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Returns true if an entry is present, without affecting recency or
    /// statistics.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Inserts or overwrites an entry, evicting the least recently used one
    /// when full. Returns the shared entry.
    pub fn put(&self, id: RecordId, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        let slot = Slot {
            entry: Arc::clone(&entry),
            tick,
        };
        if let Some(old) = inner.entries.insert(id, slot) {
            inner.recency.remove(&old.tick);
        } else if inner.entries.len() > self.capacity
            && let Some((_, evicted)) = inner.recency.pop_first()
        {
            inner.entries.remove(&evicted);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        inner.recency.insert(tick, id);
        entry
    }

    /// Removes an entry.
    pub fn remove(&self, id: &RecordId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(id) {
            Some(slot) => {
                inner.recency.remove(&slot.tick);
                true
            }
            None => false,
        }
    }

    /// Removes every entry.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Returns a snapshot of the hit, miss and eviction counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for EntryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str) -> CacheEntry {
        let mut values = Attributes::new();
        values.insert("name".to_string(), json!(name));
        CacheEntry {
            type_id: TypeId::random(),
            payload: Arc::from(format!(r#"{{"name":"{name}"}}"#).into_bytes()),
            values,
        }
    }

    #[test]
    fn get_returns_inserted_entry() {
        let cache = EntryCache::new(10);
        let id = RecordId::new();
        cache.put(id, entry("Rex"));

        let found = cache.get(&id).unwrap();
        assert_eq!(found.values["name"], json!("Rex"));
        assert!(cache.get(&RecordId::new()).is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn put_overwrites_without_growing() {
        let cache = EntryCache::new(10);
        let id = RecordId::new();
        cache.put(id, entry("Rex"));
        cache.put(id, entry("Max"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&id).unwrap().values["name"], json!("Max"));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = EntryCache::new(2);
        let a = RecordId::new();
        let b = RecordId::new();
        let c = RecordId::new();

        cache.put(a, entry("a"));
        cache.put(b, entry("b"));
        // Touch a so b becomes the eviction candidate.
        assert!(cache.get(&a).is_some());
        cache.put(c, entry("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn remove_and_invalidate_all() {
        let cache = EntryCache::new(10);
        let a = RecordId::new();
        let b = RecordId::new();
        cache.put(a, entry("a"));
        cache.put(b, entry("b"));

        assert!(cache.remove(&a));
        assert!(!cache.remove(&a));
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
        assert!(cache.get(&b).is_none());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = EntryCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put(RecordId::new(), entry("a"));
        cache.put(RecordId::new(), entry("b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_respect_capacity() {
        let cache = Arc::new(EntryCache::new(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let id = RecordId::new();
                        cache.put(id, entry("x"));
                        let _ = cache.get(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 100);
        assert_eq!(cache.stats().evictions, 8 * 500 - 100);
    }
}
