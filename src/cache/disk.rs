use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Error, Result};

use super::memory::StoredValue;
use super::stats::LevelStats;

/// On-disk entry layout: magic, flags, payload length, payload.
const MAGIC: &[u8; 4] = b"CAT1";
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const HEADER_LEN: usize = 4 + 1 + 4;

/// L3: one file per key under `dir`, named by the hex of the key hash.
/// TTL is enforced from file mtime; eviction is LRU by mtime against a
/// byte budget.
pub struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
    max_size: u64,
}

pub fn key_file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, max_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(DiskCache { dir, ttl, max_size })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key_file_name(key))
    }

    pub fn get(&self, key: &str, stats: &LevelStats) -> Option<StoredValue> {
        let path = self.path_for(key);
        match self.read_entry(&path) {
            Ok(Some(value)) => {
                stats.on_hit();
                Some(value)
            }
            Ok(None) => {
                stats.on_miss();
                None
            }
            Err(err) => {
                // A torn or foreign file is unreadable; drop it and miss.
                warn!(path = %path.display(), error = %err, "removing unreadable cache file");
                let _ = fs::remove_file(&path);
                stats.on_miss();
                None
            }
        }
    }

    fn read_entry(&self, path: &Path) -> Result<Option<StoredValue>> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };
        let mtime = metadata.modified()?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            let _ = fs::remove_file(path);
            return Ok(None);
        }

        let mut file = fs::File::open(path)?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(Error::Internal("bad cache file magic".into()));
        }
        let flags = header[4];
        let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        Ok(Some(StoredValue {
            data: Bytes::from(payload),
            compressed: flags & FLAG_COMPRESSED != 0,
            created: std::time::Instant::now(),
            ttl: self.ttl.saturating_sub(age),
            hit_count: 0,
        }))
    }

    /// Write-then-rename so a concurrent `get` sees either the old
    /// entry or the new one, never a torn file.
    pub fn set(&self, key: &str, value: &StoredValue, stats: &LevelStats) -> Result<()> {
        let final_path = self.path_for(key);
        let tmp_path = final_path.with_extension("tmp");

        let mut flags = 0u8;
        if value.compressed {
            flags |= FLAG_COMPRESSED;
        }
        let len = u32::try_from(value.data.len())
            .map_err(|_| Error::PayloadTooLarge("cache value exceeds 4GiB".into()))?;

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(MAGIC)?;
        file.write_all(&[flags])?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&value.data)?;
        file.sync_data()?;
        fs::rename(&tmp_path, &final_path)?;

        stats.on_insert(value.data.len());
        self.evict_to_budget(stats)?;
        Ok(())
    }

    pub fn delete(&self, key: &str, stats: &LevelStats) -> Result<bool> {
        let path = self.path_for(key);
        match fs::metadata(&path) {
            Ok(m) => {
                fs::remove_file(&path)?;
                stats.on_replace(m.len().saturating_sub(HEADER_LEN as u64) as usize);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Directory probe for the health check.
    pub fn healthy(&self) -> bool {
        self.dir.is_dir()
    }

    fn evict_to_budget(&self, stats: &LevelStats) -> Result<()> {
        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        let mut total: u64 = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += metadata.len();
            files.push((entry.path(), mtime, metadata.len()));
        }
        if total <= self.max_size {
            return Ok(());
        }

        // Oldest first.
        files.sort_by_key(|(_, mtime, _)| *mtime);
        for (path, _, size) in files {
            if total <= self.max_size {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                total = total.saturating_sub(size);
                stats.on_evict(size.saturating_sub(HEADER_LEN as u64) as usize);
            }
        }
        Ok(())
    }
}
