//! Tiered-cache integration: promotion across levels, a fake
//! distributed backend, statistics, and health reporting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use felis::cache::{DistributedBackend, LevelHealth, TieredCache};
use felis::config::CacheConfig;
use felis::error::{Error, Result};

/// In-memory stand-in for a distributed KV, with a kill switch.
#[derive(Default)]
struct FakeBackend {
    store: Mutex<HashMap<String, Vec<u8>>>,
    down: AtomicBool,
    gets: AtomicUsize,
}

impl FakeBackend {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::Relaxed) {
            Err(Error::Unavailable("backend is down".into()))
        } else {
            Ok(())
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DistributedBackend for FakeBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.check()?;
        self.entries().clear();
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.check()
    }
}

fn config_with_disk(dir: &std::path::Path) -> CacheConfig {
    CacheConfig {
        disk_enabled: true,
        disk_path: dir.to_path_buf(),
        compression_threshold: 128,
        ..CacheConfig::default()
    }
}

#[test]
fn set_writes_every_enabled_level() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let cache = TieredCache::new(&config_with_disk(dir.path()))
        .unwrap()
        .with_distributed(backend.clone());

    cache.set("key", b"value").unwrap();

    // L2 holds the framed value.
    assert!(backend.entries().contains_key("key"));
    // L3 holds one file named by the key hash.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(cache.get("key").unwrap().unwrap(), "value");
}

#[test]
fn l2_hit_promotes_to_l1() {
    let backend = Arc::new(FakeBackend::default());

    // Writer process populates L2.
    {
        let cache = TieredCache::new(&CacheConfig::default())
            .unwrap()
            .with_distributed(backend.clone());
        cache.set("shared", b"from-l2").unwrap();
    }

    // A second instance starts cold and finds the value in L2.
    let cache = TieredCache::new(&CacheConfig::default())
        .unwrap()
        .with_distributed(backend.clone());
    assert_eq!(cache.get("shared").unwrap().unwrap(), "from-l2");
    let after_first = backend.gets.load(Ordering::Relaxed);

    // The promoted copy now serves from L1; L2 is not consulted again.
    assert_eq!(cache.get("shared").unwrap().unwrap(), "from-l2");
    assert_eq!(backend.gets.load(Ordering::Relaxed), after_first);
    assert_eq!(cache.stats().memory.hits, 1);
    assert_eq!(cache.stats().distributed.hits, 1);
}

#[test]
fn l3_hit_backfills_l2_and_l1() {
    let dir = tempfile::tempdir().unwrap();

    // First process writes disk only.
    {
        let cache = TieredCache::new(&config_with_disk(dir.path())).unwrap();
        cache.set("cold", b"from-disk").unwrap();
    }

    // Second process has an empty L1/L2 over the same disk.
    let backend = Arc::new(FakeBackend::default());
    let cache = TieredCache::new(&config_with_disk(dir.path()))
        .unwrap()
        .with_distributed(backend.clone());

    assert_eq!(cache.get("cold").unwrap().unwrap(), "from-disk");
    assert_eq!(cache.stats().disk.hits, 1);
    // Backfilled upward.
    assert!(backend.entries().contains_key("cold"));
    assert_eq!(cache.get("cold").unwrap().unwrap(), "from-disk");
    assert_eq!(cache.stats().memory.hits, 1);
}

#[test]
fn compressed_values_cross_levels_transparently() {
    let dir = tempfile::tempdir().unwrap();
    let value = "pattern".repeat(200);

    {
        let cache = TieredCache::new(&config_with_disk(dir.path())).unwrap();
        cache.set("big", value.as_bytes()).unwrap();
    }

    // The disk file is smaller than the value (compressed) yet reads
    // back intact through a fresh instance.
    let file = std::fs::read_dir(dir.path())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert!(file.metadata().unwrap().len() < value.len() as u64);

    let cache = TieredCache::new(&config_with_disk(dir.path())).unwrap();
    assert_eq!(cache.get("big").unwrap().unwrap(), value.as_bytes());
}

#[test]
fn down_backend_degrades_to_miss_and_reports_health() {
    let backend = Arc::new(FakeBackend::default());
    let cache = TieredCache::new(&CacheConfig::default())
        .unwrap()
        .with_distributed(backend.clone());

    cache.set("k", b"v").unwrap();
    backend.down.store(true, Ordering::Relaxed);

    // L1 still answers; a cold key degrades to a miss, not an error.
    assert_eq!(cache.get("k").unwrap().unwrap(), "v");
    assert_eq!(cache.get("cold-key").unwrap(), None);
    assert_eq!(cache.health().distributed, Some(LevelHealth::Down));

    backend.down.store(false, Ordering::Relaxed);
    assert!(matches!(
        cache.health().distributed,
        Some(LevelHealth::Ok) | Some(LevelHealth::Degraded)
    ));
}

#[test]
fn delete_purges_all_levels() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let cache = TieredCache::new(&config_with_disk(dir.path()))
        .unwrap()
        .with_distributed(backend.clone());

    cache.set("gone", b"soon").unwrap();
    cache.delete("gone").unwrap();

    assert_eq!(cache.get("gone").unwrap(), None);
    assert!(!backend.entries().contains_key("gone"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn hit_ratio_tracks_traffic() {
    let cache = TieredCache::new(&CacheConfig::default()).unwrap();
    cache.set("a", b"1").unwrap();

    cache.get("a").unwrap();
    cache.get("a").unwrap();
    cache.get("missing").unwrap();

    let memory = cache.stats().memory;
    assert_eq!(memory.hits, 2);
    assert_eq!(memory.misses, 1);
    assert!((memory.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
}
