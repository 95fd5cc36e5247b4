//! In-memory cache for tests and local development.
//!
//! Entries expire on read once their TTL has elapsed, measured with tokio's clock so that tests
//! can advance time while paused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheEntry, CacheError, CacheResult, CacheStore};

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<HashMap<String, (CacheEntry, Instant)>>,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    unavailable: AtomicBool,
}

/// A [`CacheStore`] keeping all entries in a `HashMap`.
///
/// The cache is [`Clone`] so tests can hold a handle for inspection while the engine owns a
/// shared copy.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache(Arc<Inner>);

impl InMemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with [`CacheError::Unavailable`], or recovers.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.0.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Returns the live entry under `key` without counting a call.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.0.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(entry, _)| entry.clone())
    }

    /// Returns the remaining time to live of `key`, if it is live.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.0.entries.lock().unwrap();
        let (_, expires) = entries.get(key)?;
        expires
            .checked_duration_since(Instant::now())
            .filter(|ttl| !ttl.is_zero())
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.0.entries.lock().unwrap();
        entries.values().filter(|(_, expires)| *expires > now).count()
    }

    /// Returns `true` if the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of `get` calls made through [`CacheStore`].
    pub fn get_calls(&self) -> usize {
        self.0.get_calls.load(Ordering::Relaxed)
    }

    /// Returns the number of `set` calls made through [`CacheStore`].
    pub fn set_calls(&self) -> usize {
        self.0.set_calls.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.0.unavailable.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheStore for InMemoryCache {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.0.get_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut entries = self.0.entries.lock().unwrap();
        match entries.get(key) {
            Some((entry, expires)) if *expires > Instant::now() => Ok(Some(entry.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> CacheResult<()> {
        self.0.set_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let expires = Instant::now() + Duration::from_secs(super::ttl_seconds(ttl));
        self.0
            .entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (entry, expires));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_entries() {
        let cache = InMemoryCache::new();
        let entry = CacheEntry::new(&b"\x89PNG"[..], "image/png");

        cache
            .set("compressed:a.png", entry.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get("compressed:a.png").await.unwrap(), Some(entry));
        assert_eq!(cache.get("compressed:b.png").await.unwrap(), None);
        assert_eq!(cache.get_calls(), 2);
        assert_eq!(cache.set_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = InMemoryCache::new();
        cache
            .set("k", CacheEntry::new(&b"v"[..], "text/plain"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.ttl("k"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache
            .set("k", CacheEntry::new(&b"first"[..], "text/plain"), ttl)
            .await
            .unwrap();
        cache
            .set("k", CacheEntry::new(&b"second"[..], "text/html"), ttl)
            .await
            .unwrap();

        let entry = cache.peek("k").unwrap();
        assert_eq!(entry.bytes.as_ref(), b"second");
        assert_eq!(entry.content_type, "text/html");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn simulated_outage() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);

        let entry = CacheEntry::new(&b"v"[..], "text/plain");
        assert!(matches!(
            cache.set("k", entry, Duration::from_secs(1)).await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.get("k").await.is_err());

        cache.set_unavailable(false);
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
