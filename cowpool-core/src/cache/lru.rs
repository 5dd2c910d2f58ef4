// vim: tw=80
use divbuf::DivBufShared;
use metrohash::{MetroBuildHasher, MetroHash64};
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    hash::BuildHasherDefault,
    sync::Arc
};
use tracing::{Level, event};
use super::Key;

struct LruEntry {
    buf: Arc<DivBufShared>,
    /// Pointer to the next less recently used entry
    lru: Option<Key>,
    /// Pointer to the next more recently used entry
    mru: Option<Key>,
}

impl LruEntry {
    /// Is anybody outside of the cache still using this block?
    fn is_held(&self) -> bool {
        Arc::strong_count(&self.buf) > 1
    }
}

impl Debug for LruEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LruEntry {{ lru: {:?}, mru: {:?} }}", self.lru, self.mru)
    }
}

/// LRU cache that never evicts held entries.
///
/// If every entry is held, the cache may grow beyond its capacity.
#[derive(Debug)]
pub struct LruCache {
    /// Capacity of the `LruCache` in bytes, not number of entries
    capacity: usize,
    /// Pointer to the least recently used entry
    lru: Option<Key>,
    /// Pointer to the most recently used entry
    mru: Option<Key>,
    /// Current memory consumption of all cache entries, excluding overhead
    size: usize,
    /// Block storage.
    store: HashMap<Key, LruEntry, BuildHasherDefault<MetroHash64>>,
}

impl LruCache {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn drop_cache(&mut self) {
        self.store = HashMap::with_hasher(MetroBuildHasher::default());
        self.lru = None;
        self.mru = None;
        self.size = 0;
    }

    /// Evict unheld entries, least recently used first, until `incoming` more
    /// bytes would fit.
    fn expire(&mut self, incoming: usize) {
        let mut cursor = self.lru;
        while self.size + incoming > self.capacity {
            let Some(key) = cursor else {
                break;
            };
            let entry = &self.store[&key];
            cursor = entry.mru;
            if !entry.is_held() {
                self.remove(&key);
            }
        }
    }

    /// Evict unheld entries until the cache fits within its capacity
    pub fn shrink(&mut self) {
        self.expire(0)
    }

    pub fn get(&mut self, key: &Key) -> Option<Arc<DivBufShared>> {
        if self.mru == Some(*key) {
            return Some(self.store[key].buf.clone());
        }
        let mru = self.mru;
        let v = self.store.get_mut(key)?;
        let v_mru = v.mru;
        let v_lru = v.lru;
        v.mru = None;
        v.lru = mru;
        let buf = v.buf.clone();
        // Not the MRU, so somebody must be more recent
        let more_recent = v_mru.expect("LRU linkage is corrupt");
        self.store.get_mut(&more_recent).unwrap().lru = v_lru;
        if let Some(lru) = &v_lru {
            self.store.get_mut(lru).unwrap().mru = v_mru;
        } else {
            debug_assert_eq!(self.lru, Some(*key));
            self.lru = v_mru;
        }
        if let Some(mru) = &mru {
            self.store.get_mut(mru).unwrap().mru = Some(*key);
        }
        self.mru = Some(*key);
        Some(buf)
    }

    pub fn insert(&mut self, key: Key, buf: Arc<DivBufShared>) {
        let cache_space = buf.len();
        if self.store.contains_key(&key) {
            // Two tasks raced to read the same immutable block.
            event!(Level::WARN, "duplicate_cache_insertion");
            return;
        }
        self.expire(cache_space);
        let entry = LruEntry { buf, mru: None, lru: self.mru};
        self.store.insert(key, entry);
        self.size += cache_space;
        if let Some(mru) = self.mru {
            if let Some(v) = self.store.get_mut(&mru) {
                debug_assert!(v.mru.is_none());
                v.mru = Some(key);
            }
        }
        self.mru = Some(key);
        if self.lru.is_none() {
            self.lru = Some(key);
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn remove(&mut self, key: &Key) -> Option<Arc<DivBufShared>> {
        self.store.remove(key).map(|v| {
            self.size -= v.buf.len();
            if let Some(mru) = v.mru {
                self.store.get_mut(&mru).unwrap().lru = v.lru;
            } else {
                debug_assert_eq!(self.mru, Some(*key));
                self.mru = v.lru;
            }
            if let Some(lru) = v.lru {
                self.store.get_mut(&lru).unwrap().mru = v.mru;
            } else {
                debug_assert_eq!(self.lru, Some(*key));
                self.lru = v.mru;
            }
            v.buf
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let store = HashMap::with_hasher(MetroBuildHasher::default());
        LruCache{capacity, lru: None, mru: None, size: 0, store}
    }
}

// LCOV_EXCL_STOP
