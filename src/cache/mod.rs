//! Multi-level cache: L1 in-process LRU, optional L2 distributed KV,
//! optional L3 disk. Exposed both as a programmatic store
//! ([`TieredCache`]) and as a response-caching middleware
//! ([`response::ResponseCache`]).

mod disk;
mod distributed;
mod memory;
pub mod response;
mod stats;

pub use disk::{key_file_name, DiskCache};
pub use distributed::DistributedBackend;
#[cfg(feature = "redis")]
pub use distributed::RedisBackend;
pub use memory::{MemoryCache, StoredValue};
pub use response::{CacheRule, ResponseCache};
pub use stats::{CacheHealth, CacheStats, LevelHealth, LevelSnapshot, StatsSnapshot};

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

use distributed::{decode_framed, encode_framed};

enum FlightState {
    Building { since: Instant },
    Done(std::result::Result<Bytes, String>),
}

struct FlightSlot {
    state: Mutex<FlightState>,
    cv: Condvar,
}

impl FlightSlot {
    fn new() -> Self {
        FlightSlot {
            state: Mutex::new(FlightState::Building {
                since: Instant::now(),
            }),
            cv: Condvar::new(),
        }
    }
}

/// Outcome of [`TieredCache::get_or_build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Served from a cache level.
    Hit(Bytes),
    /// This caller ran the build function.
    Built(Bytes),
    /// Another caller's concurrent build was shared.
    Shared(Bytes),
}

impl Lookup {
    pub fn into_bytes(self) -> Bytes {
        match self {
            Lookup::Hit(b) | Lookup::Built(b) | Lookup::Shared(b) => b,
        }
    }

    pub fn was_cached(&self) -> bool {
        !matches!(self, Lookup::Built(_))
    }
}

/// The multi-level cache. Shared across requests; all methods take
/// `&self` and use interior locking.
pub struct TieredCache {
    config: CacheConfig,
    memory: MemoryCache,
    distributed: Option<Arc<dyn DistributedBackend>>,
    distributed_degraded: AtomicBool,
    disk: Option<DiskCache>,
    stats: CacheStats,
    inflight: DashMap<String, Arc<FlightSlot>>,
}

impl TieredCache {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let disk = if config.disk_enabled {
            Some(DiskCache::new(
                &config.disk_path,
                config.disk_ttl,
                config.disk_max_size,
            )?)
        } else {
            None
        };

        let distributed = Self::connect_distributed(config)?;

        Ok(TieredCache {
            config: config.clone(),
            memory: MemoryCache::new(config.memory_capacity),
            distributed,
            distributed_degraded: AtomicBool::new(false),
            disk,
            stats: CacheStats::default(),
            inflight: DashMap::new(),
        })
    }

    #[cfg(feature = "redis")]
    fn connect_distributed(config: &CacheConfig) -> Result<Option<Arc<dyn DistributedBackend>>> {
        if !config.distributed_enabled {
            return Ok(None);
        }
        let backend = distributed::RedisBackend::connect(&config.distributed_endpoint)?;
        Ok(Some(Arc::new(backend)))
    }

    #[cfg(not(feature = "redis"))]
    fn connect_distributed(config: &CacheConfig) -> Result<Option<Arc<dyn DistributedBackend>>> {
        if config.distributed_enabled {
            warn!("cache.distributed_enabled is set but the `redis` feature is off; running without L2");
        }
        Ok(None)
    }

    /// Inject a custom L2 backend (tests, alternative stores).
    pub fn with_distributed(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    /// Probe L1 → L2 → L3, promoting hits toward the faster levels.
    /// Values come back decompressed; a full miss is `None`.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(value) = self.memory.get(key, &self.stats.memory) {
            return Ok(Some(self.decompress(&value)?));
        }

        if let Some(backend) = &self.distributed {
            match backend.get(key) {
                Ok(Some(raw)) => {
                    self.distributed_degraded.store(false, Ordering::Relaxed);
                    if let Some((payload, compressed)) = decode_framed(&raw) {
                        self.stats.distributed.on_hit();
                        let value = StoredValue::new(
                            Bytes::from(payload),
                            compressed,
                            self.config.memory_ttl,
                        );
                        self.memory.set(key, value.clone(), &self.stats.memory);
                        return Ok(Some(self.decompress(&value)?));
                    }
                    self.stats.distributed.on_miss();
                }
                Ok(None) => {
                    self.distributed_degraded.store(false, Ordering::Relaxed);
                    self.stats.distributed.on_miss();
                }
                Err(err) => {
                    // A down L2 degrades to a miss; the request goes on.
                    warn!(error = %err, "distributed cache get failed");
                    self.distributed_degraded.store(true, Ordering::Relaxed);
                    self.stats.distributed.on_miss();
                }
            }
        }

        if let Some(disk) = &self.disk {
            if let Some(value) = disk.get(key, &self.stats.disk) {
                if let Some(backend) = &self.distributed {
                    let framed = encode_framed(&value.data, value.compressed);
                    if let Err(err) = backend.set(key, &framed, self.config.distributed_ttl) {
                        warn!(error = %err, "distributed cache promote failed");
                        self.distributed_degraded.store(true, Ordering::Relaxed);
                    } else {
                        self.stats.distributed.on_insert(framed.len());
                    }
                }
                let promoted = StoredValue::new(
                    value.data.clone(),
                    value.compressed,
                    self.config.memory_ttl.min(value.ttl),
                );
                self.memory.set(key, promoted, &self.stats.memory);
                return Ok(Some(self.decompress(&value)?));
            }
        }

        Ok(None)
    }

    /// Write all enabled levels with their respective TTLs.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.set_with_ttl(key, value, None)
    }

    /// Write all enabled levels; `ttl` overrides the L1/L2 configured
    /// TTLs (L3 keeps its mtime-based ceiling).
    pub fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        if value.len() > self.config.max_value_size {
            return Err(Error::PayloadTooLarge(format!(
                "cache value of {} bytes exceeds max_value_size",
                value.len()
            )));
        }

        let (data, compressed) = self.maybe_compress(value);

        let memory_ttl = ttl.unwrap_or(self.config.memory_ttl);
        self.memory.set(
            key,
            StoredValue::new(data.clone(), compressed, memory_ttl),
            &self.stats.memory,
        );

        if let Some(backend) = &self.distributed {
            let framed = encode_framed(&data, compressed);
            let l2_ttl = ttl.unwrap_or(self.config.distributed_ttl);
            match backend.set(key, &framed, l2_ttl) {
                Ok(()) => {
                    self.distributed_degraded.store(false, Ordering::Relaxed);
                    self.stats.distributed.on_insert(framed.len());
                }
                Err(err) => {
                    warn!(error = %err, "distributed cache set failed");
                    self.distributed_degraded.store(true, Ordering::Relaxed);
                }
            }
        }

        if let Some(disk) = &self.disk {
            let value = StoredValue::new(data, compressed, self.config.disk_ttl);
            if let Err(err) = disk.set(key, &value, &self.stats.disk) {
                warn!(error = %err, "disk cache set failed");
            }
        }

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.memory.delete(key, &self.stats.memory);
        if let Some(backend) = &self.distributed {
            if let Err(err) = backend.delete(key) {
                warn!(error = %err, "distributed cache delete failed");
            }
        }
        if let Some(disk) = &self.disk {
            disk.delete(key, &self.stats.disk)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.memory.clear(&self.stats.memory);
        if let Some(backend) = &self.distributed {
            if let Err(err) = backend.clear() {
                warn!(error = %err, "distributed cache clear failed");
            }
        }
        if let Some(disk) = &self.disk {
            disk.clear()?;
        }
        Ok(())
    }

    /// Single-flight lookup: concurrent misses on `key` run `build`
    /// exactly once and share its result. A builder that outlives
    /// `build_timeout` gets one waiter promoted in its place.
    ///
    /// `build` returns the value plus whether it should be stored.
    pub fn get_or_build<F>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        build_timeout: Duration,
        build: F,
    ) -> Result<Lookup>
    where
        F: FnOnce() -> Result<(Bytes, bool)>,
    {
        if let Some(value) = self.get(key)? {
            return Ok(Lookup::Hit(value));
        }

        use dashmap::mapref::entry::Entry;
        let (slot, mut is_builder) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let slot = Arc::new(FlightSlot::new());
                e.insert(slot.clone());
                (slot, true)
            }
        };

        if !is_builder {
            let mut state = slot.state.lock();
            loop {
                let elapsed = match &*state {
                    FlightState::Done(Ok(bytes)) => {
                        return Ok(Lookup::Shared(bytes.clone()));
                    }
                    FlightState::Done(Err(msg)) => {
                        return Err(Error::Internal(msg.clone()));
                    }
                    FlightState::Building { since } => since.elapsed(),
                };
                if elapsed >= build_timeout {
                    // Builder timed out; this waiter takes over.
                    debug!(key, "promoting single-flight waiter to builder");
                    *state = FlightState::Building {
                        since: Instant::now(),
                    };
                    is_builder = true;
                    break;
                }
                slot.cv.wait_for(&mut state, build_timeout - elapsed);
            }
        }

        debug_assert!(is_builder);
        let built = build();
        {
            let mut state = slot.state.lock();
            *state = match &built {
                Ok((bytes, _)) => FlightState::Done(Ok(bytes.clone())),
                Err(err) => FlightState::Done(Err(err.to_string())),
            };
            slot.cv.notify_all();
        }

        // Store before dropping the flight entry: a caller arriving in
        // between must find either the entry or the cached value, never
        // a gap that would trigger a second build.
        let store_result = match &built {
            Ok((bytes, true)) => self.set_with_ttl(key, bytes, ttl),
            _ => Ok(()),
        };
        self.inflight.remove(key);

        let (bytes, _) = built?;
        store_result?;
        Ok(Lookup::Built(bytes))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            memory: LevelHealth::Ok,
            distributed: self.distributed.as_ref().map(|backend| {
                match backend.ping() {
                    Ok(()) => {
                        if self.distributed_degraded.load(Ordering::Relaxed) {
                            LevelHealth::Degraded
                        } else {
                            LevelHealth::Ok
                        }
                    }
                    Err(_) => LevelHealth::Down,
                }
            }),
            disk: self.disk.as_ref().map(|disk| {
                if disk.healthy() {
                    LevelHealth::Ok
                } else {
                    LevelHealth::Down
                }
            }),
        }
    }

    fn maybe_compress(&self, value: &[u8]) -> (Bytes, bool) {
        if self.config.compression_enabled && value.len() >= self.config.compression_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            if encoder.write_all(value).is_ok() {
                if let Ok(compressed) = encoder.finish() {
                    // Keep the original if compression did not help.
                    if compressed.len() < value.len() {
                        return (Bytes::from(compressed), true);
                    }
                }
            }
        }
        (Bytes::copy_from_slice(value), false)
    }

    fn decompress(&self, value: &StoredValue) -> Result<Bytes> {
        if !value.compressed {
            return Ok(value.data.clone());
        }
        let mut decoder = GzDecoder::new(value.data.as_ref());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Internal(format!("cache decompression failed: {}", e)))?;
        Ok(Bytes::from(out))
    }
}
