use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(key, default_secs))
}

/// Server configuration. Build programmatically via `Config::default()`
/// plus field edits, or load from environment variables (with `.env`
/// support) via `Config::from_env()`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listening host (default: 127.0.0.1)
    pub host: String,
    /// Listening port (default: 8000)
    pub port: u16,
    /// Request worker pool size (default: number of CPUs)
    pub worker_threads: usize,
    /// Pin request workers to CPU cores (default: false)
    pub pin_workers: bool,

    /// Inbound header block limit; exceeding returns 431
    pub max_header_bytes: usize,
    /// Inbound body limit; exceeding returns 413
    pub max_body_bytes: usize,

    /// Per-connection read timeout; incomplete requests return 408
    pub read_timeout: Duration,
    /// Per-connection write timeout
    pub write_timeout: Duration,
    /// Idle keep-alive socket disposal
    pub keepalive_timeout: Duration,
    /// Hard cap on requests served per keep-alive connection
    pub max_requests_per_connection: u32,

    pub cache: CacheConfig,
    pub tasks: TaskConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// L1 capacity in entries
    pub memory_capacity: usize,
    pub memory_ttl: Duration,
    /// Largest value accepted by `set`, in bytes
    pub max_value_size: usize,
    pub compression_enabled: bool,
    /// Values at or above this size are compressed
    pub compression_threshold: usize,

    pub distributed_enabled: bool,
    pub distributed_endpoint: String,
    pub distributed_ttl: Duration,

    pub disk_enabled: bool,
    pub disk_path: PathBuf,
    pub disk_ttl: Duration,
    /// L3 size budget in bytes
    pub disk_max_size: u64,

    /// Headers folded into the response-cache fingerprint
    pub selected_headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Background worker thread count
    pub workers: usize,
    /// Maximum queued (non-terminal) tasks; submit fails beyond this
    pub queue_capacity: usize,
    pub default_max_attempts: u32,
    /// Base delay of the bounded-exponential retry backoff
    pub default_backoff: Duration,
    /// Backoff growth cap
    pub max_backoff: Duration,
    /// How long terminal task records stay queryable
    pub result_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Part bodies above this size spool to a temp file
    pub max_buffered_bytes: usize,
    /// Spool directory; defaults to the OS temp dir
    pub spool_dir: PathBuf,
    /// Optional scanner command; receives the part path, non-zero exit rejects
    pub virus_scan_cmd: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8000,
            worker_threads: num_cpus::get(),
            pin_workers: false,
            max_header_bytes: 16 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(75),
            max_requests_per_connection: 10_000,
            cache: CacheConfig::default(),
            tasks: TaskConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            memory_capacity: 10_000,
            memory_ttl: Duration::from_secs(300),
            max_value_size: 4 * 1024 * 1024,
            compression_enabled: true,
            compression_threshold: 4 * 1024,
            distributed_enabled: false,
            distributed_endpoint: "redis://127.0.0.1:6379".to_string(),
            distributed_ttl: Duration::from_secs(1800),
            disk_enabled: false,
            disk_path: PathBuf::from("./felis-cache"),
            disk_ttl: Duration::from_secs(86_400),
            disk_max_size: 1024 * 1024 * 1024,
            selected_headers: Vec::new(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            workers: 4,
            queue_capacity: 10_000,
            default_max_attempts: 1,
            default_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            result_ttl: Duration::from_secs(300),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            max_buffered_bytes: 1024 * 1024,
            spool_dir: std::env::temp_dir(),
            virus_scan_cmd: None,
        }
    }
}

impl Config {
    /// Load configuration from `FELIS_*` environment variables (with
    /// `.env` support). Unset variables keep their defaults.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let defaults = Config::default();
        Config {
            host: std::env::var("FELIS_HOST").unwrap_or(defaults.host),
            port: env_or("FELIS_PORT", defaults.port),
            worker_threads: env_or("FELIS_WORKER_THREADS", defaults.worker_threads),
            pin_workers: env_or("FELIS_PIN_WORKERS", defaults.pin_workers),
            max_header_bytes: env_or("FELIS_MAX_HEADER_BYTES", defaults.max_header_bytes),
            max_body_bytes: env_or("FELIS_MAX_BODY_BYTES", defaults.max_body_bytes),
            read_timeout: env_secs("FELIS_READ_TIMEOUT_SECS", 30),
            write_timeout: env_secs("FELIS_WRITE_TIMEOUT_SECS", 30),
            keepalive_timeout: env_secs("FELIS_KEEPALIVE_TIMEOUT_SECS", 75),
            max_requests_per_connection: env_or(
                "FELIS_MAX_REQUESTS_PER_CONNECTION",
                defaults.max_requests_per_connection,
            ),
            cache: CacheConfig {
                memory_capacity: env_or(
                    "FELIS_CACHE_MEMORY_CAPACITY",
                    defaults.cache.memory_capacity,
                ),
                memory_ttl: env_secs("FELIS_CACHE_MEMORY_TTL_SECS", 300),
                max_value_size: env_or(
                    "FELIS_CACHE_MAX_VALUE_SIZE",
                    defaults.cache.max_value_size,
                ),
                compression_enabled: env_or(
                    "FELIS_CACHE_COMPRESSION_ENABLED",
                    defaults.cache.compression_enabled,
                ),
                compression_threshold: env_or(
                    "FELIS_CACHE_COMPRESSION_THRESHOLD",
                    defaults.cache.compression_threshold,
                ),
                distributed_enabled: env_or(
                    "FELIS_CACHE_DISTRIBUTED_ENABLED",
                    defaults.cache.distributed_enabled,
                ),
                distributed_endpoint: std::env::var("FELIS_CACHE_DISTRIBUTED_ENDPOINT")
                    .unwrap_or(defaults.cache.distributed_endpoint),
                distributed_ttl: env_secs("FELIS_CACHE_DISTRIBUTED_TTL_SECS", 1800),
                disk_enabled: env_or("FELIS_CACHE_DISK_ENABLED", defaults.cache.disk_enabled),
                disk_path: std::env::var("FELIS_CACHE_DISK_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.cache.disk_path),
                disk_ttl: env_secs("FELIS_CACHE_DISK_TTL_SECS", 86_400),
                disk_max_size: env_or("FELIS_CACHE_DISK_MAX_SIZE", defaults.cache.disk_max_size),
                selected_headers: std::env::var("FELIS_CACHE_SELECTED_HEADERS")
                    .map(|v| {
                        v.split(',')
                            .map(|s| s.trim().to_ascii_lowercase())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.cache.selected_headers),
            },
            tasks: TaskConfig {
                workers: env_or("FELIS_TASKS_WORKERS", defaults.tasks.workers),
                queue_capacity: env_or(
                    "FELIS_TASKS_QUEUE_CAPACITY",
                    defaults.tasks.queue_capacity,
                ),
                default_max_attempts: env_or(
                    "FELIS_TASKS_DEFAULT_MAX_ATTEMPTS",
                    defaults.tasks.default_max_attempts,
                ),
                default_backoff: env_secs("FELIS_TASKS_DEFAULT_BACKOFF_SECS", 1),
                max_backoff: env_secs("FELIS_TASKS_MAX_BACKOFF_SECS", 60),
                result_ttl: env_secs("FELIS_TASKS_RESULT_TTL_SECS", 300),
            },
            upload: UploadConfig {
                max_buffered_bytes: env_or(
                    "FELIS_UPLOAD_MAX_BUFFERED_BYTES",
                    defaults.upload.max_buffered_bytes,
                ),
                spool_dir: std::env::var("FELIS_UPLOAD_SPOOL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.spool_dir),
                virus_scan_cmd: std::env::var("FELIS_UPLOAD_VIRUS_SCAN_CMD").ok(),
            },
        }
    }

    /// Full listening address, `host:port`.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert!(config.worker_threads >= 1);
        assert_eq!(config.server_addr(), "127.0.0.1:8000");
        assert!(config.cache.memory_capacity > 0);
        assert!(config.tasks.workers > 0);
    }

    #[test]
    fn duration_fields_are_durations() {
        let config = Config::default();
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.cache.memory_ttl, Duration::from_secs(300));
    }
}
