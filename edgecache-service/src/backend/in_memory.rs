//! In-memory origin for tests.
//!
//! This provides a [`BlobStore`] backed by a `HashMap`, removing the need for a running
//! S3-compatible service in unit and integration tests. The backend is [`Clone`] so tests can
//! hold a handle for inspection while the engine owns a shared copy. Every handle counts the
//! calls made through it, so tests can assert whether a request reached the origin.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::StreamExt;

use crate::PayloadStream;
use crate::backend::common::{
    BackendError, BackendResult, BlobStore, Credentials, ObjectDescriptor, SharedBlobStore,
};
use crate::range::ByteRange;

/// Payloads are emitted in chunks of this size to exercise streaming consumers.
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Default)]
struct Store {
    objects: HashMap<(String, String), (String, Bytes)>,
    denied: HashSet<String>,
    restricted: HashMap<String, Credentials>,
}

#[derive(Debug, Default)]
struct Counters {
    stat: AtomicUsize,
    get: AtomicUsize,
}

/// A [`BlobStore`] that keeps all objects in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<Mutex<Store>>,
    counters: Arc<Counters>,
    credentials: Option<Credentials>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or overwrites an object.
    pub fn insert(&self, bucket: &str, key: &str, content_type: &str, payload: impl Into<Bytes>) {
        self.store.lock().unwrap().objects.insert(
            (bucket.to_owned(), key.to_owned()),
            (content_type.to_owned(), payload.into()),
        );
    }

    /// Removes an object, if present.
    pub fn remove(&self, bucket: &str, key: &str) {
        self.store
            .lock()
            .unwrap()
            .objects
            .remove(&(bucket.to_owned(), key.to_owned()));
    }

    /// Rejects every request to the given bucket with [`BackendError::AccessDenied`].
    pub fn deny(&self, bucket: &str) {
        self.store.lock().unwrap().denied.insert(bucket.to_owned());
    }

    /// Only allows requests to the given bucket that carry exactly these credentials.
    pub fn restrict(&self, bucket: &str, credentials: Credentials) {
        self.store
            .lock()
            .unwrap()
            .restricted
            .insert(bucket.to_owned(), credentials);
    }

    /// Returns the number of `stat` calls made through any handle.
    pub fn stat_calls(&self) -> usize {
        self.counters.stat.load(Ordering::Relaxed)
    }

    /// Returns the number of `get` calls made through any handle.
    pub fn get_calls(&self) -> usize {
        self.counters.get.load(Ordering::Relaxed)
    }

    fn lookup(&self, bucket: &str, key: &str) -> BackendResult<(String, Bytes)> {
        let store = self.store.lock().unwrap();
        if store.denied.contains(bucket) {
            return Err(BackendError::AccessDenied);
        }
        if let Some(required) = store.restricted.get(bucket) {
            if self.credentials.as_ref() != Some(required) {
                return Err(BackendError::AccessDenied);
            }
        }

        store
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or(BackendError::NotFound)
    }
}

fn etag(payload: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn stat(&self, bucket: &str, key: &str) -> BackendResult<ObjectDescriptor> {
        self.counters.stat.fetch_add(1, Ordering::Relaxed);
        let (content_type, payload) = self.lookup(bucket, key)?;
        Ok(ObjectDescriptor {
            size: payload.len() as u64,
            content_type,
            etag: etag(&payload),
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<PayloadStream> {
        self.counters.get.fetch_add(1, Ordering::Relaxed);
        let (_, mut payload) = self.lookup(bucket, key)?;

        if let Some(range) = range {
            if range.end >= payload.len() as u64 {
                return Err(BackendError::Generic {
                    context: format!("range {range} exceeds object size {}", payload.len()),
                    cause: "invalid range".into(),
                });
            }
            payload = payload.slice(range.start as usize..=range.end as usize);
        }

        let mut chunks = Vec::new();
        while !payload.is_empty() {
            let len = payload.len().min(CHUNK_SIZE);
            chunks.push(Ok(payload.split_to(len)));
        }
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    fn with_credentials(&self, credentials: &Credentials) -> BackendResult<SharedBlobStore> {
        Ok(Arc::new(Self {
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            credentials: Some(credentials.clone()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::read_to_vec;

    #[tokio::test]
    async fn serves_whole_objects_in_chunks() {
        let backend = InMemoryBackend::new();
        let payload: Vec<u8> = (0..40_000).map(|i| (i % 256) as u8).collect();
        backend.insert("media", "a.bin", "application/octet-stream", payload.clone());

        let stat = backend.stat("media", "a.bin").await.unwrap();
        assert_eq!(stat.size, 40_000);
        assert_eq!(stat.content_type, "application/octet-stream");

        let stream = backend.get("media", "a.bin", None).await.unwrap();
        assert_eq!(read_to_vec(stream).await.unwrap(), payload);
        assert_eq!(backend.stat_calls(), 1);
        assert_eq!(backend.get_calls(), 1);
    }

    #[tokio::test]
    async fn serves_ranges() {
        let backend = InMemoryBackend::new();
        backend.insert("media", "a.txt", "text/plain", &b"hello world"[..]);

        let stream = backend
            .get("media", "a.txt", Some(ByteRange::new(6, 10)))
            .await
            .unwrap();
        assert_eq!(read_to_vec(stream).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn missing_and_denied() {
        let backend = InMemoryBackend::new();
        backend.insert("private", "a.txt", "text/plain", &b"secret"[..]);
        backend.deny("private");

        assert!(matches!(
            backend.stat("media", "nope").await,
            Err(BackendError::NotFound)
        ));
        assert!(matches!(
            backend.stat("private", "a.txt").await,
            Err(BackendError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn restricted_buckets_require_credentials() {
        let backend = InMemoryBackend::new();
        let credentials = Credentials::new("ak", "sk");
        backend.insert("scoped", "a.txt", "text/plain", &b"data"[..]);
        backend.restrict("scoped", credentials.clone());

        assert!(matches!(
            backend.stat("scoped", "a.txt").await,
            Err(BackendError::AccessDenied)
        ));

        let wrong = backend
            .with_credentials(&Credentials::new("ak", "wrong"))
            .unwrap();
        assert!(matches!(
            wrong.stat("scoped", "a.txt").await,
            Err(BackendError::AccessDenied)
        ));

        let scoped = backend.with_credentials(&credentials).unwrap();
        assert_eq!(scoped.stat("scoped", "a.txt").await.unwrap().size, 4);
        // Calls through derived handles are counted on the original.
        assert_eq!(backend.stat_calls(), 3);
    }
}
