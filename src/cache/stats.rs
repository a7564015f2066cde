use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters for one cache level. `bytes` tracks the resident
/// payload size and moves in both directions.
#[derive(Debug, Default)]
pub struct LevelStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bytes: AtomicU64,
}

impl LevelStats {
    pub fn on_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_insert(&self, size: usize) {
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn on_evict(&self, size: usize) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size as u64, Ordering::Relaxed);
    }

    /// Removal that is not an LRU/TTL eviction (delete, replace, clear).
    pub fn on_replace(&self, size: usize) {
        self.bytes.fetch_sub(size as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LevelSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        LevelSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct LevelSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes: u64,
    pub hit_ratio: f64,
}

/// Aggregated statistics across all levels.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub memory: LevelStats,
    pub distributed: LevelStats,
    pub disk: LevelStats,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub memory: LevelSnapshot,
    pub distributed: LevelSnapshot,
    pub disk: LevelSnapshot,
}

impl CacheStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory: self.memory.snapshot(),
            distributed: self.distributed.snapshot(),
            disk: self.disk.snapshot(),
        }
    }
}

/// Health of one cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelHealth {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheHealth {
    pub memory: LevelHealth,
    /// `None` when the level is disabled.
    pub distributed: Option<LevelHealth>,
    pub disk: Option<LevelHealth>,
}
