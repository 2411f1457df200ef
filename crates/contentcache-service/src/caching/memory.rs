use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;

use crate::config::MemoryCacheConfig;

use super::CacheKey;

/// The weak index is pruned of dead references once it grows beyond this many entries.
const WEAK_PRUNE_THRESHOLD: usize = 1024;

/// An entry in the [`MemoryTier`].
#[derive(Debug)]
pub struct MemoryEntry<T> {
    /// The decoded value, shared with whoever is using it.
    pub value: Option<Arc<T>>,
    /// The raw bytes the value was decoded from, if they are kept.
    pub payload: Option<Bytes>,
    /// The cost this entry counts against [`MemoryCacheConfig::max_cost`].
    pub cost: u64,
    pub stored_at: SystemTime,
    pub last_accessed_at: SystemTime,
}

impl<T> MemoryEntry<T> {
    pub fn new(value: Option<Arc<T>>, payload: Option<Bytes>, cost: u64) -> Self {
        let now = SystemTime::now();
        Self {
            value,
            payload,
            cost,
            stored_at: now,
            last_accessed_at: now,
        }
    }
}

impl<T> Clone for MemoryEntry<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            payload: self.payload.clone(),
            cost: self.cost,
            stored_at: self.stored_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

/// A value that is no longer owned by the tier, but may still be alive elsewhere.
#[derive(Debug)]
struct WeakEntry<T> {
    value: Weak<T>,
    cost: u64,
}

#[derive(Debug)]
struct Inner<T> {
    /// Strongly held entries, in recency order.
    entries: LruCache<CacheKey, MemoryEntry<T>>,
    total_cost: u64,
    /// Every value ever stored, as long as something else keeps it alive.
    weak: HashMap<CacheKey, WeakEntry<T>>,
}

impl<T> Inner<T> {
    fn insert(&mut self, key: CacheKey, entry: MemoryEntry<T>) {
        self.total_cost += entry.cost;
        if let Some((_, replaced)) = self.entries.push(key, entry) {
            self.total_cost -= replaced.cost;
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<MemoryEntry<T>> {
        let entry = self.entries.pop(key)?;
        self.total_cost -= entry.cost;
        Some(entry)
    }

    /// Evicts least recently accessed entries until both limits hold.
    ///
    /// The evicted entries are returned so they can be dropped outside of the lock.
    fn evict(&mut self, config: &MemoryCacheConfig) -> Vec<MemoryEntry<T>> {
        let mut evicted = Vec::new();
        while (config.max_count > 0 && self.entries.len() > config.max_count)
            || (config.max_cost > 0 && self.total_cost > config.max_cost)
        {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.total_cost -= entry.cost;
            tracing::trace!(%key, cost = entry.cost, "Evicting entry from memory");
            evicted.push(entry);
        }
        if !evicted.is_empty() {
            metric!(counter("caches.memory.evicted") += evicted.len() as i64);
        }
        evicted
    }

    fn prune_weak(&mut self) {
        self.weak.retain(|_, entry| entry.value.strong_count() > 0);
    }
}

/// A bounded, in-process cache of decoded values.
///
/// Entries are evicted in least-recently-accessed order once either the count or the cost limit
/// is exceeded; a limit of `0` means unlimited. Reads update recency.
///
/// With [`weak_secondary`](MemoryCacheConfig::weak_secondary) enabled, the tier also keeps a
/// weak reference to every stored value. Such a reference may disappear at any time, and never
/// keeps a value alive. It lets a value that is still in use elsewhere be found again after it
/// was evicted or [purged](Self::purge), in which case it is put back into the strong tier.
///
/// All state is behind one lock that is only held for the bookkeeping itself. Values are never
/// decoded or dropped by user code while holding it.
#[derive(Debug)]
pub struct MemoryTier<T> {
    config: MemoryCacheConfig,
    inner: Mutex<Inner<T>>,
}

impl<T> MemoryTier<T> {
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_cost: 0,
                weak: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Looks up an entry, marking it as most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<MemoryEntry<T>> {
        let mut evicted = Vec::new();
        let hit = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(entry) = inner.entries.get_mut(key) {
                entry.last_accessed_at = SystemTime::now();
                Some(entry.clone())
            } else if self.config.weak_secondary {
                let revived = inner.weak.get(key).map(|w| (w.value.upgrade(), w.cost));
                match revived {
                    Some((Some(value), cost)) => {
                        let entry = MemoryEntry::new(Some(value), None, cost);
                        inner.insert(key.clone(), entry.clone());
                        evicted = inner.evict(&self.config);
                        metric!(counter("caches.memory.weak_hit") += 1);
                        Some(entry)
                    }
                    Some((None, _)) => {
                        inner.weak.remove(key);
                        None
                    }
                    None => None,
                }
            } else {
                None
            }
        };

        drop(evicted);

        if hit.is_some() {
            metric!(counter("caches.memory.hit") += 1);
        }
        hit
    }

    /// Stores an entry, evicting older ones if a limit is exceeded.
    ///
    /// An entry whose cost alone exceeds the cost limit is not admitted, and any previous entry
    /// for the same key is dropped instead.
    pub fn set(&self, key: CacheKey, entry: MemoryEntry<T>) {
        if !self.config.enabled {
            return;
        }

        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();

            if self.config.max_cost > 0 && entry.cost > self.config.max_cost {
                tracing::trace!(%key, cost = entry.cost, "Entry exceeds memory cost limit");
                dropped.extend(inner.remove(&key));
                dropped.push(entry);
            } else {
                if self.config.weak_secondary
                    && let Some(value) = &entry.value
                {
                    inner.weak.insert(
                        key.clone(),
                        WeakEntry {
                            value: Arc::downgrade(value),
                            cost: entry.cost,
                        },
                    );
                    if inner.weak.len() > WEAK_PRUNE_THRESHOLD.max(2 * inner.entries.len()) {
                        inner.prune_weak();
                    }
                }

                inner.insert(key, entry);
                dropped = inner.evict(&self.config);
            }
        }
        drop(dropped);
    }

    /// Checks for an entry without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.contains(key)
            || (self.config.weak_secondary
                && inner
                    .weak
                    .get(key)
                    .is_some_and(|w| w.value.strong_count() > 0))
    }

    pub fn remove(&self, key: &CacheKey) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.weak.remove(key);
            inner.remove(key)
        };
        drop(removed);
    }

    /// Removes all entries, including the weak index.
    pub fn clear(&self) {
        let (entries, weak) = {
            let mut inner = self.inner.lock().unwrap();
            inner.total_cost = 0;
            let entries = std::mem::replace(&mut inner.entries, LruCache::unbounded());
            (entries, std::mem::take(&mut inner.weak))
        };
        drop(entries);
        drop(weak);
    }

    /// Drops all strongly held entries in response to memory pressure.
    ///
    /// Values that are still referenced elsewhere remain reachable through the weak index.
    pub fn purge(&self) {
        let entries = {
            let mut inner = self.inner.lock().unwrap();
            inner.total_cost = 0;
            std::mem::replace(&mut inner.entries, LruCache::unbounded())
        };
        metric!(counter("caches.memory.purged") += entries.len() as i64);
        tracing::debug!(entries = entries.len(), "Purged memory tier");
        drop(entries);

        self.inner.lock().unwrap().prune_weak();
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().unwrap().total_cost
    }

    /// The number of strongly held entries.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Keys of the strongly held entries, least recently used first.
    pub fn keys(&self) -> Vec<CacheKey> {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }
}
