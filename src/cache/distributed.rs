use std::time::Duration;

use crate::error::Result;

/// L2: a distributed KV the cache can delegate to. Expiry is the
/// backend's job; values are opaque framed bytes.
pub trait DistributedBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    /// Liveness probe for the health check.
    fn ping(&self) -> Result<()>;
}

/// Wire framing for L2 values: one flags byte (bit0 = compressed)
/// followed by the payload. Keeps the compression flag attached to the
/// value across processes.
pub fn encode_framed(payload: &[u8], compressed: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(u8::from(compressed));
    out.extend_from_slice(payload);
    out
}

pub fn decode_framed(raw: &[u8]) -> Option<(Vec<u8>, bool)> {
    let (&flags, payload) = raw.split_first()?;
    Some((payload.to_vec(), flags & 1 != 0))
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use redis::Commands;

    /// Redis-backed L2 level. Enabled with the `redis` cargo feature
    /// and `cache.distributed_enabled`.
    pub struct RedisBackend {
        client: redis::Client,
        conn: Mutex<Option<redis::Connection>>,
    }

    impl RedisBackend {
        pub fn connect(endpoint: &str) -> Result<Self> {
            let client = redis::Client::open(endpoint)
                .map_err(|e| Error::Unavailable(format!("redis endpoint: {}", e)))?;
            Ok(RedisBackend {
                client,
                conn: Mutex::new(None),
            })
        }

        fn with_conn<T>(
            &self,
            op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
        ) -> Result<T> {
            let mut guard = self.conn.lock();
            if guard.is_none() {
                *guard = Some(
                    self.client
                        .get_connection()
                        .map_err(|e| Error::Unavailable(format!("redis connect: {}", e)))?,
                );
            }
            let conn = guard.as_mut().ok_or_else(|| {
                Error::Unavailable("redis connection unavailable".to_string())
            })?;
            op(conn).map_err(|e| {
                // Drop the connection so the next call reconnects.
                *guard = None;
                Error::Unavailable(format!("redis: {}", e))
            })
        }
    }

    impl DistributedBackend for RedisBackend {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.with_conn(|conn| conn.get(key))
        }

        fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            self.with_conn(|conn| conn.set_ex(key, value, ttl.as_secs().max(1)))
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.with_conn(|conn| conn.del(key))
        }

        fn clear(&self) -> Result<()> {
            self.with_conn(|conn| redis::cmd("FLUSHDB").query(conn))
        }

        fn ping(&self) -> Result<()> {
            self.with_conn(|conn| redis::cmd("PING").query(conn))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_round_trip() {
        let framed = encode_framed(b"hello", true);
        let (payload, compressed) = decode_framed(&framed).unwrap();
        assert_eq!(payload, b"hello");
        assert!(compressed);

        let framed = encode_framed(b"", false);
        let (payload, compressed) = decode_framed(&framed).unwrap();
        assert!(payload.is_empty());
        assert!(!compressed);
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(decode_framed(&[]).is_none());
    }
}
