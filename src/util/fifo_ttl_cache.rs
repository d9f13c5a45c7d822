use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

pub type OnItemDropped<K> = Box<dyn Fn(&K) + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    position: u64,
    expires_at: Instant,
}

/// A bounded map with FIFO eviction and a fixed time-to-live per entry.
///
/// Eviction order is by insertion, not by access: a `get` neither refreshes an entry's position
///  nor its TTL. Re-setting an existing key counts as a fresh insertion though, i.e. the key moves
///  to the newest position and its TTL starts over.
///
/// Expired entries are removed lazily when they are accessed (or by [FifoTtlCache::values]).
///
/// NB: The clock is tokio's, so tests can pause and advance it
pub struct FifoTtlCache<K, V> {
    ttl: Duration,
    max_size: usize,
    items: FxHashMap<K, CacheEntry<V>>,
    /// insertion position -> key, i.e. the first entry is the next to be evicted
    drop_queue: BTreeMap<u64, K>,
    next_position: u64,
    on_item_dropped: Option<OnItemDropped<K>>,
}

impl<K: Debug, V> Debug for FifoTtlCache<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FifoTtlCache{{ttl:{:?}, max_size:{}, keys:{:?}}}", self.ttl, self.max_size, self.drop_queue.values().collect::<Vec<_>>())
    }
}

impl<K: Clone + Eq + Hash + Debug, V> FifoTtlCache<K, V> {
    pub fn new(ttl: Duration, max_size: usize) -> FifoTtlCache<K, V> {
        FifoTtlCache {
            ttl,
            max_size,
            items: Default::default(),
            drop_queue: Default::default(),
            next_position: 0,
            on_item_dropped: None,
        }
    }

    /// The callback is invoked for every entry that leaves the cache, regardless of the reason:
    ///  explicit deletion, replacement by `set`, capacity eviction or expiry.
    pub fn with_drop_callback(ttl: Duration, max_size: usize, on_item_dropped: impl Fn(&K) + Send + Sync + 'static) -> FifoTtlCache<K, V> {
        let mut result = Self::new(ttl, max_size);
        result.on_item_dropped = Some(Box::new(on_item_dropped));
        result
    }

    pub fn set(&mut self, key: K, value: V) {
        if self.max_size == 0 {
            return;
        }

        self.delete(&key);

        if self.items.len() >= self.max_size {
            if let Some((_, oldest)) = self.drop_queue.pop_first() {
                trace!(key = ?oldest, "cache is full: evicting oldest entry");
                self.items.remove(&oldest);
                self.notify_dropped(&oldest);
            }
        }

        let position = self.next_position;
        self.next_position += 1;

        self.drop_queue.insert(position, key.clone());
        self.items.insert(key, CacheEntry {
            value,
            position,
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// returns the removed value, if any
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let entry = self.items.remove(key)?;
        self.drop_queue.remove(&entry.position);
        self.notify_dropped(key);
        Some(entry.value)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.prune_if_expired(key, Instant::now())? {
            return None;
        }
        self.items.get(key).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.prune_if_expired(key, Instant::now())? {
            return None;
        }
        self.items.get_mut(key).map(|e| &mut e.value)
    }

    /// all values that are not expired, in insertion order. Expired entries are removed as a side
    ///  effect.
    pub fn values(&mut self) -> Vec<&V> {
        let now = Instant::now();

        let expired = self.drop_queue.values()
            .filter(|k| self.items.get(*k).is_some_and(|e| e.expires_at <= now))
            .cloned()
            .collect::<Vec<_>>();
        for key in expired {
            self.delete(&key);
        }

        self.drop_queue.values()
            .flat_map(|k| self.items.get(k))
            .map(|e| &e.value)
            .collect()
    }

    /// number of entries, including expired entries that were not yet pruned
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// returns `None` if there is no entry for the key, and otherwise whether it was expired (and
    ///  is now removed)
    fn prune_if_expired(&mut self, key: &K, now: Instant) -> Option<bool> {
        let expires_at = self.items.get(key)?.expires_at;
        if expires_at <= now {
            trace!(?key, "dropping expired entry");
            self.delete(key);
            return Some(true);
        }
        Some(false)
    }

    fn notify_dropped(&self, key: &K) {
        if let Some(callback) = &self.on_item_dropped {
            callback(key);
        }
    }
}
