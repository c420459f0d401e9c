//! Process-local LRU of decoded weight artifacts.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::key::CacheKey;
use crate::weights::WeightArtifact;

/// Decoded artifacts shared by `Arc`, bounded by entry count.
pub(crate) struct MemoryCache {
    cache: LruCache<CacheKey, Arc<WeightArtifact>>,
    evictions: u64,
}

impl MemoryCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            evictions: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &CacheKey) -> Option<Arc<WeightArtifact>> {
        self.cache.get(key).cloned()
    }

    pub(crate) fn insert(&mut self, key: CacheKey, artifact: Arc<WeightArtifact>) {
        if let Some((evicted, _)) = self.cache.push(key.clone(), artifact) {
            if evicted != key {
                self.evictions += 1;
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) {
        self.cache.pop(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn evictions(&self) -> u64 {
        self.evictions
    }
}
