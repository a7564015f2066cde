//! Per-request overhead trimming: a cached `Date` header value,
//! refreshed by a background thread so the hot path never formats time.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

static CACHED_DATE: OnceLock<Arc<RwLock<String>>> = OnceLock::new();

fn now_header() -> String {
    httpdate::fmt_http_date(std::time::SystemTime::now())
}

/// Initialize the Date header cache and start the background updater.
/// Safe to call multiple times; only the first call spawns the thread.
pub fn init_date_cache() {
    let _ = CACHED_DATE.get_or_init(|| {
        let val = Arc::new(RwLock::new(now_header()));
        let val_clone = val.clone();
        std::thread::Builder::new()
            .name("felis-date".to_string())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(500));
                let hv = now_header();
                // write() blocks readers for ~nanoseconds
                *val_clone.write().unwrap_or_else(|e| e.into_inner()) = hv;
            })
            .ok();
        val
    });
}

/// Get the cached Date header value, or compute it live if the cache
/// was never initialized.
#[inline]
pub fn cached_date_header() -> String {
    match CACHED_DATE.get() {
        Some(lock) => lock.read().unwrap_or_else(|e| e.into_inner()).clone(),
        None => now_header(),
    }
}
