// vim: tw=80
//! Block cache
//!
//! Caches verified, decompressed blocks.  Blocks are immutable once written,
//! so a block's first DVA plus its birth txg identifies its contents forever.

use crate::types::*;
use divbuf::DivBufShared;
use futures::channel::oneshot;
use std::{
    collections::HashMap,
    sync::Arc
};

mod lru;

/// Key type used by `Cache`
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Key {
    dva: Dva,
    birth: TxgT,
}

impl Key {
    pub fn new(dva: Dva, birth: TxgT) -> Self {
        Key{dva, birth}
    }
}

/// Result of a physical read, shared with every task that waited for it
pub type ReadResult = Result<Arc<DivBufShared>>;

/// Cache hit and miss counters
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Current memory consumption, in bytes
    pub size: usize,
    pub capacity: usize,
}

/// Basic read-only block cache.
///
/// The cache is read-only because any attempt to change a block would also
/// change its address.
#[derive(Debug)]
pub struct Cache {
    cache: self::lru::LruCache,
    hits: u64,
    misses: u64,
    /// Reads in progress, and the tasks waiting on them.
    #[doc(hidden)]
    pub pending_insertions: HashMap<Key, Vec<oneshot::Sender<ReadResult>>>,
}

impl Cache {
    /// Get the maximum memory consumption of the cache, in bytes.
    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Drop all data from the cache, for testing purposes
    pub fn drop_cache(&mut self) {
        self.cache.drop_cache()
    }

    /// Get a reference to a cached block.
    ///
    /// The block will be marked as the most recently used.  As long as the
    /// reference is alive, the block can't be evicted.
    pub fn get(&mut self, key: &Key) -> Option<Arc<DivBufShared>> {
        let r = self.cache.get(key);
        if r.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        r
    }

    /// Add a new block to the cache.
    ///
    /// The block will be marked as the most recently used.
    #[tracing::instrument(skip(self, buf))]
    pub fn insert(&mut self, key: Key, buf: Arc<DivBufShared>) {
        self.cache.insert(key, buf)
    }

    /// Evict whatever unheld blocks are needed to get back within capacity.
    /// Blocks that were held when inserted can leave the cache oversized.
    pub fn shrink(&mut self) {
        self.cache.shrink()
    }

    /// Remove a block from the cache.
    pub fn remove(&mut self, key: &Key) -> Option<Arc<DivBufShared>> {
        self.cache.remove(key)
    }

    /// Get the current memory consumption of the cache, in bytes.
    ///
    /// Only the cached blocks themselves are included, not the overhead of
    /// managing them.
    pub fn size(&self) -> usize {
        self.cache.size()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.size(),
            capacity: self.capacity()
        }
    }

    /// Create a new cache with the given capacity, in bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        let pending_insertions = Default::default();
        let cache = self::lru::LruCache::with_capacity(capacity);
        Self{cache, hits: 0, misses: 0, pending_insertions}
    }
}

// LCOV_EXCL_STOP
