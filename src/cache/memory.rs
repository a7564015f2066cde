use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::stats::LevelStats;

const SHARDS: usize = 16;

/// A value as stored by any cache level: payload plus the metadata that
/// must survive promotion between levels.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub data: Bytes,
    pub compressed: bool,
    pub created: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
}

impl StoredValue {
    pub fn new(data: Bytes, compressed: bool, ttl: Duration) -> Self {
        StoredValue {
            data,
            compressed,
            created: Instant::now(),
            ttl,
            hit_count: 0,
        }
    }

    pub fn expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }
}

/// L1: in-process LRU with per-entry TTL, sharded by key hash to limit
/// lock contention.
pub struct MemoryCache {
    shards: Vec<Mutex<LruCache<String, StoredValue>>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity / SHARDS).max(1);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..SHARDS)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        MemoryCache { shards }
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, StoredValue>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Lookup with lazy TTL eviction. Stats are the caller's; this
    /// updates only entry-local hit counts.
    pub fn get(&self, key: &str, stats: &LevelStats) -> Option<StoredValue> {
        let mut shard = self.shard(key).lock();
        match shard.get_mut(key) {
            Some(entry) if entry.expired() => {
                let size = entry.data.len();
                shard.pop(key);
                stats.on_evict(size);
                stats.on_miss();
                None
            }
            Some(entry) => {
                entry.hit_count += 1;
                stats.on_hit();
                Some(entry.clone())
            }
            None => {
                stats.on_miss();
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: StoredValue, stats: &LevelStats) {
        let size = value.data.len();
        let mut shard = self.shard(key).lock();
        if let Some((old_key, old)) = shard.push(key.to_string(), value) {
            if old_key == key {
                // Replacement, not an LRU eviction.
                stats.on_replace(old.data.len());
            } else {
                stats.on_evict(old.data.len());
            }
        }
        stats.on_insert(size);
    }

    pub fn delete(&self, key: &str, stats: &LevelStats) -> bool {
        let mut shard = self.shard(key).lock();
        match shard.pop(key) {
            Some(old) => {
                stats.on_replace(old.data.len());
                true
            }
            None => false,
        }
    }

    pub fn clear(&self, stats: &LevelStats) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            while let Some((_, old)) = shard.pop_lru() {
                stats.on_replace(old.data.len());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
