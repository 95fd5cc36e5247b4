use std::fmt;
use std::time::Duration;

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};

use super::{CacheEntry, CacheError, CacheResult, CacheStore, content_type_key, ttl_seconds};

/// A [`CacheStore`] on Redis, using a connection pool shared by all requests.
///
/// The payload is stored under the entry key and its content type under a companion key. Both
/// are written in a single `MULTI`/`EXEC` transaction with the same expiry.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Creates a cache for the given connection URL, e.g. `redis://localhost:6379`.
    ///
    /// Connections are established lazily, so this succeeds even if Redis is not reachable yet.
    pub fn new(url: &str) -> CacheResult<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        Ok(Self { pool })
    }
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("status", &self.pool.status())
            .finish()
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let mut conn = self.pool.get().await?;

        let (bytes, content_type): (Option<Vec<u8>>, Option<String>) = redis::pipe()
            .get(key)
            .get(content_type_key(key))
            .query_async(&mut conn)
            .await?;

        // The companion key may have been evicted independently.
        Ok(match (bytes, content_type) {
            (Some(bytes), Some(content_type)) => Some(CacheEntry::new(bytes, content_type)),
            _ => None,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, entry), fields(size = entry.bytes.len()))]
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let seconds = ttl_seconds(ttl);

        let () = redis::pipe()
            .atomic()
            .set_ex(key, entry.bytes.as_ref(), seconds)
            .ignore()
            .set_ex(content_type_key(key), entry.content_type, seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }
}
