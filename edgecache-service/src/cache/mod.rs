//! Key-value cache stores holding small objects and recompressed images.
//!
//! The engine follows a cache-aside model: it reads through [`CacheStore::get`] and writes with
//! [`CacheStore::set`], and expiry is owned entirely by the store. Entries are never deleted
//! explicitly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

mod in_memory;
mod redis;

pub use in_memory::InMemoryCache;
pub use redis::RedisCache;

/// Suffix of the companion key holding an entry's content type.
pub const CONTENT_TYPE_SUFFIX: &str = ":content-type";

/// A shared, type-erased [`CacheStore`] instance.
pub type SharedCacheStore = Arc<dyn CacheStore>;

/// Returns the cache key for a full object.
pub fn object_key(bucket: &str, key: &str) -> String {
    format!("cdn:{bucket}:{key}")
}

/// Returns the cache key for a (possibly recompressed) image.
pub fn image_key(key: &str) -> String {
    format!("compressed:{key}")
}

/// Returns the companion key storing the content type of `key`.
pub fn content_type_key(key: &str) -> String {
    format!("{key}{CONTENT_TYPE_SUFFIX}")
}

/// A cached payload and the content type it is served with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// The payload, byte-identical to what was stored.
    pub bytes: Bytes,
    /// The content type to serve the payload with.
    pub content_type: String,
}

impl CacheEntry {
    /// Creates a new entry.
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }
}

/// A key-value store with per-entry expiry.
///
/// Implementations must be safe for concurrent use. The last writer of a key wins.
#[async_trait::async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Looks up an entry. Expired and partially written entries are misses.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Stores an entry and its content type together, expiring both after `ttl`.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> CacheResult<()>;
}

/// Errors returned by [`CacheStore`] implementations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No connection could be obtained from the pool.
    #[error("cache connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The store rejected or failed a command.
    #[error("cache command failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The store cannot be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Converts a TTL into whole seconds, as expected by `SETEX`.
///
/// Sub-second TTLs are rounded up, as stores reject an expiry of zero.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
