//! The delivery decision engine.
//!
//! [`DeliveryEngine`] turns a request for an object into a [`Delivery`]: status, headers, and a
//! body that is either buffered or streamed from the origin. The strategy is chosen once per
//! request and reported as a [`DeliveryDecision`]:
//!
//! - Requests with a `Range` header are served from a ranged origin read and never touch the
//!   cache.
//! - Full requests consult the cache first. A hit is served without contacting the origin.
//! - On a miss, objects up to the small object threshold are buffered, served, and written to
//!   the cache in the background. Larger objects are streamed without buffering or caching.
//!
//! Image requests follow the same cache-aside shape, but recompress oversized images to fit the
//! image budget before caching them.
//!
//! All origin and cache calls of a request share one deadline. Once a streaming response has
//! been handed out, later failures can only truncate the body.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::Instrument;

use crate::PayloadStream;
use crate::backend::{Credentials, ObjectDescriptor, SharedBlobStore};
use crate::cache::{self, CacheEntry, SharedCacheStore};
use crate::compress::{self, Compression, ImageFormat};
use crate::copy::{STREAM_BUFFER_SIZE, body_channel, copy_bounded};
use crate::error::{DeliveryError, RejectReason};
use crate::populate::{CachePopulator, PopulateOptions};
use crate::range::{self, RangeError};

/// Objects up to this size are buffered and cached, larger ones are streamed.
pub const SMALL_OBJECT_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Time to live of cache entries when no cache time is configured.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Header signalling whether a response was served from the cache.
pub const X_FROM_CACHE: &str = "x-from-cache";

/// Header signalling that an image was recompressed.
pub const X_COMPRESSED: &str = "x-compressed";

/// Number of chunks buffered between the transfer task and a streamed response body.
const BODY_CHANNEL_CAPACITY: usize = 4;

/// Tunables of the [`DeliveryEngine`].
#[derive(Clone, Debug)]
pub struct DeliveryOptions {
    /// Objects up to this size are buffered and cached.
    pub small_object_threshold: u64,
    /// Advertised `max-age` and cache entry time to live. Zero disables client caching.
    pub cache_time: Duration,
    /// Upper bound for a single background cache write.
    pub populate_timeout: Duration,
    /// Maximum number of background cache writes in flight.
    pub max_pending_writes: usize,
    /// Origin bucket serving image requests.
    pub image_bucket: String,
    /// Images larger than this are recompressed before caching.
    pub image_budget: u64,
    /// Recompressed images are downscaled to at most this width.
    pub image_max_width: u32,
    /// Images larger than this are not fetched at all.
    pub max_image_fetch: u64,
    /// Deadline for all origin and cache calls of a request, including streaming.
    pub request_timeout: Duration,
    /// Honor caller-supplied origin credentials.
    pub allow_credential_override: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            small_object_threshold: SMALL_OBJECT_THRESHOLD,
            cache_time: DEFAULT_CACHE_TTL,
            populate_timeout: Duration::from_secs(30),
            max_pending_writes: 256,
            image_bucket: "default-bucket".into(),
            image_budget: 100 * 1024,
            image_max_width: 1024,
            max_image_fetch: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(300),
            allow_credential_override: false,
        }
    }
}

impl DeliveryOptions {
    fn cache_ttl(&self) -> Duration {
        if self.cache_time.is_zero() {
            DEFAULT_CACHE_TTL
        } else {
            self.cache_time
        }
    }
}

/// A request for a whole object or a byte range of it.
#[derive(Clone, Debug, Default)]
pub struct DeliveryRequest {
    /// The origin bucket.
    pub bucket: String,
    /// The object key. A leading slash is ignored.
    pub key: String,
    /// The raw `Range` header, if any.
    pub range: Option<String>,
    /// Serve as an attachment with the key's file name.
    pub download: bool,
    /// Caller-supplied origin credentials for this request only.
    pub credentials: Option<Credentials>,
}

/// A request for an image from the image bucket.
#[derive(Clone, Debug, Default)]
pub struct ImageRequest {
    /// The object key. A leading slash is ignored.
    pub key: String,
}

/// The serving strategy chosen for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryDecision {
    /// Served from the cache without contacting the origin.
    ServeFromCache,
    /// Buffered from the origin and written to the cache in the background.
    ServeSmallWithCachePopulate,
    /// Streamed from the origin without buffering or caching.
    ServeLargeStreamed,
    /// A byte range streamed from the origin.
    ServeRange,
    /// Not served.
    Reject(RejectReason),
}

impl DeliveryDecision {
    /// A short identifier, suitable as a metric tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServeFromCache => "cache",
            Self::ServeSmallWithCachePopulate => "small",
            Self::ServeLargeStreamed => "large",
            Self::ServeRange => "range",
            Self::Reject(reason) => reason.as_str(),
        }
    }
}

/// The payload of a [`Delivery`].
pub enum DeliveryBody {
    /// No payload.
    Empty,
    /// A fully buffered payload.
    Full(Bytes),
    /// A payload streamed from the origin. An error item aborts the response.
    Stream(PayloadStream),
}

impl fmt::Debug for DeliveryBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A response ready to be sent.
#[derive(Debug)]
pub struct Delivery {
    /// The response status.
    pub status: StatusCode,
    /// The response headers, including `Content-Length`.
    pub headers: HeaderMap,
    /// The response body.
    pub body: DeliveryBody,
    /// How the request was served.
    pub decision: DeliveryDecision,
}

/// Serves objects from the origin through the cache.
///
/// The engine is cheap to clone. All clones share the origin, the cache, and the background
/// cache population.
#[derive(Clone, Debug)]
pub struct DeliveryEngine(Arc<EngineInner>);

#[derive(Debug)]
struct EngineInner {
    origin: SharedBlobStore,
    cache: SharedCacheStore,
    populator: CachePopulator,
    options: DeliveryOptions,
}

impl DeliveryEngine {
    /// Creates an engine serving from `origin` through `cache`.
    pub fn new(origin: SharedBlobStore, cache: SharedCacheStore, options: DeliveryOptions) -> Self {
        let populator = CachePopulator::new(
            cache.clone(),
            PopulateOptions {
                ttl: options.cache_ttl(),
                timeout: options.populate_timeout,
                max_pending: options.max_pending_writes,
            },
        );

        Self(Arc::new(EngineInner {
            origin,
            cache,
            populator,
            options,
        }))
    }

    /// Returns the engine's tunables.
    pub fn options(&self) -> &DeliveryOptions {
        &self.0.options
    }

    /// Returns the background cache population.
    pub fn populator(&self) -> &CachePopulator {
        &self.0.populator
    }

    /// Chooses the serving strategy for a request.
    ///
    /// `size` is the object size from the origin and is ignored for range requests and cache
    /// hits, which are decided before the origin is consulted.
    pub fn classify(&self, has_range: bool, cache_hit: bool, size: u64) -> DeliveryDecision {
        if has_range {
            DeliveryDecision::ServeRange
        } else if cache_hit {
            DeliveryDecision::ServeFromCache
        } else if size <= self.0.options.small_object_threshold {
            DeliveryDecision::ServeSmallWithCachePopulate
        } else {
            DeliveryDecision::ServeLargeStreamed
        }
    }

    /// Serves an object, or the byte range of it given in the request.
    #[tracing::instrument(skip_all, fields(bucket = %request.bucket, key = %request.key))]
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<Delivery, DeliveryError> {
        let result = self.deliver_inner(&request).await;
        let result = result.map(|mut delivery| {
            if request.download {
                set_download_headers(&mut delivery.headers, &request.key);
            }
            delivery
        });
        record(&result, "object");
        result
    }

    async fn deliver_inner(&self, request: &DeliveryRequest) -> Result<Delivery, DeliveryError> {
        let bucket = request.bucket.as_str();
        let key = request.key.trim_start_matches('/');
        if bucket.is_empty() {
            tracing::warn!("missing bucket parameter");
            return Err(DeliveryError::BadRequest("missing bucket parameter"));
        }
        if key.is_empty() {
            tracing::warn!("invalid file path");
            return Err(DeliveryError::BadRequest("invalid file path"));
        }

        let deadline = Instant::now() + self.0.options.request_timeout;
        let (origin, scoped) = self.origin_for(request.credentials.as_ref())?;

        if let Some(range) = &request.range {
            return self
                .serve_range(&origin, bucket, key, range, deadline)
                .await;
        }

        // Scoped requests must reach the origin so that its authorization applies.
        let cache_key = cache::object_key(bucket, key);
        if !scoped {
            if let Some(entry) = self.lookup(&cache_key, deadline).await {
                return Ok(self.cached_response(entry));
            }
        }

        let object = within(deadline, origin.stat(bucket, key)).await?;
        tracing::debug!(size = object.size, content_type = %object.content_type, "object info");

        match self.classify(false, false, object.size) {
            DeliveryDecision::ServeSmallWithCachePopulate => {
                let stream = within(deadline, origin.get(bucket, key, None)).await?;
                let bytes = read_to_limit(stream, object.size, deadline).await?;
                if (bytes.len() as u64) < object.size {
                    tracing::warn!(
                        expected = object.size,
                        received = bytes.len(),
                        "origin returned fewer bytes than declared"
                    );
                }

                if !scoped {
                    let entry = CacheEntry::new(bytes.clone(), object.content_type.clone());
                    self.0.populator.submit(cache_key, entry);
                }

                let mut headers = self.object_headers(&object, bytes.len() as u64);
                self.set_cache_headers(&mut headers, false);
                let body = if bytes.is_empty() {
                    DeliveryBody::Empty
                } else {
                    DeliveryBody::Full(bytes)
                };
                Ok(Delivery {
                    status: StatusCode::OK,
                    headers,
                    body,
                    decision: DeliveryDecision::ServeSmallWithCachePopulate,
                })
            }
            _ => {
                let stream = within(deadline, origin.get(bucket, key, None)).await?;
                let mut headers = self.object_headers(&object, object.size);
                self.set_cache_headers(&mut headers, false);
                Ok(Delivery {
                    status: StatusCode::OK,
                    headers,
                    body: DeliveryBody::Stream(stream_body(stream, None, object.size, deadline)),
                    decision: DeliveryDecision::ServeLargeStreamed,
                })
            }
        }
    }

    async fn serve_range(
        &self,
        origin: &SharedBlobStore,
        bucket: &str,
        key: &str,
        header: &str,
        deadline: Instant,
    ) -> Result<Delivery, DeliveryError> {
        let object = within(deadline, origin.stat(bucket, key)).await?;

        let range = range::parse_range(header, object.size).map_err(|error| {
            match error {
                RangeError::Malformed => tracing::warn!(header, "malformed range header"),
                RangeError::Unsatisfiable => {
                    tracing::debug!(header, size = object.size, "range not satisfiable")
                }
            }
            DeliveryError::RangeNotSatisfiable { size: object.size }
        })?;

        let stream = within(deadline, origin.get(bucket, key, Some(range))).await?;

        let mut headers = self.object_headers(&object, range.len());
        insert_header(
            &mut headers,
            header::CONTENT_RANGE,
            &range.content_range(object.size),
        );
        self.set_cache_headers(&mut headers, false);

        Ok(Delivery {
            status: StatusCode::PARTIAL_CONTENT,
            headers,
            body: DeliveryBody::Stream(stream_body(
                stream,
                Some(range.len()),
                range.len(),
                deadline,
            )),
            decision: DeliveryDecision::ServeRange,
        })
    }

    /// Serves an image from the image bucket, recompressing it to fit the image budget.
    #[tracing::instrument(skip_all, fields(key = %request.key))]
    pub async fn deliver_image(&self, request: ImageRequest) -> Result<Delivery, DeliveryError> {
        let result = self.deliver_image_inner(&request).await;
        record(&result, "image");
        result
    }

    async fn deliver_image_inner(&self, request: &ImageRequest) -> Result<Delivery, DeliveryError> {
        let key = request.key.trim_start_matches('/');
        if key.is_empty() {
            return Err(DeliveryError::BadRequest("invalid file path"));
        }

        let options = &self.0.options;
        let deadline = Instant::now() + options.request_timeout;

        let cache_key = cache::image_key(key);
        if let Some(entry) = self.lookup(&cache_key, deadline).await {
            return Ok(self.cached_response(entry));
        }

        let bucket = options.image_bucket.as_str();
        let object = within(deadline, self.0.origin.stat(bucket, key)).await?;
        if object.size > options.max_image_fetch {
            return Err(DeliveryError::UpstreamTooLarge {
                size: object.size,
                limit: options.max_image_fetch,
            });
        }

        let stream = within(deadline, self.0.origin.get(bucket, key, None)).await?;
        let bytes = read_to_limit(stream, object.size, deadline).await?;

        let mut entry = CacheEntry::new(bytes, object.content_type);
        let mut compressed = false;
        if entry.bytes.len() as u64 > options.image_budget {
            if let Some(compression) = self.recompress(&entry, deadline).await {
                entry = CacheEntry::new(compression.bytes, compression.content_type);
                compressed = true;
            }
        }

        self.0.populator.submit(cache_key, entry.clone());

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::CONTENT_TYPE, &entry.content_type);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.bytes.len()));
        if compressed {
            headers.insert(X_COMPRESSED, HeaderValue::from_static("true"));
        }
        self.set_cache_headers(&mut headers, false);

        Ok(Delivery {
            status: StatusCode::OK,
            headers,
            body: DeliveryBody::Full(entry.bytes),
            decision: DeliveryDecision::ServeSmallWithCachePopulate,
        })
    }

    /// Fits an image to the image budget on the blocking pool.
    ///
    /// Returns `None` if the original should be kept. This includes searches that do not finish
    /// before `deadline`.
    async fn recompress(&self, entry: &CacheEntry, deadline: Instant) -> Option<Compression> {
        let content_type = entry.content_type.clone();
        if compress::is_passthrough(&content_type)
            || ImageFormat::from_content_type(&content_type).is_none()
        {
            return None;
        }

        let raw = entry.bytes.clone();
        let budget = self.0.options.image_budget;
        let max_width = self.0.options.image_max_width;
        let task = tokio::task::spawn_blocking(move || {
            compress::fit_to_budget(&raw, &content_type, budget, max_width)
        });

        let Ok(result) = tokio::time::timeout_at(deadline, task).await else {
            tracing::warn!("recompression timed out, caching original");
            merni::counter!("image.recompress": 1, "outcome" => "timeout");
            return None;
        };

        match result {
            Ok(Ok(compression)) if compression.reencoded => {
                tracing::debug!(
                    original = entry.bytes.len(),
                    compressed = compression.bytes.len(),
                    changed_format = compression.changed_format,
                    "recompressed image"
                );
                merni::counter!("image.recompress": 1, "outcome" => "fitted");
                Some(compression)
            }
            Ok(Ok(_)) => None,
            Ok(Err(error)) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "recompression failed, caching original"
                );
                merni::counter!("image.recompress": 1, "outcome" => "failed");
                None
            }
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "recompression task failed"
                );
                None
            }
        }
    }

    fn origin_for(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<(SharedBlobStore, bool), DeliveryError> {
        let Some(credentials) = credentials else {
            return Ok((self.0.origin.clone(), false));
        };

        if !self.0.options.allow_credential_override {
            tracing::warn!("ignoring caller-supplied credentials, override is disabled");
            return Ok((self.0.origin.clone(), false));
        }

        tracing::info!(
            access_key = %credentials.access_key,
            "using caller-supplied credentials"
        );
        let origin = self
            .0
            .origin
            .with_credentials(credentials)
            .map_err(|e| DeliveryError::internal("failed to initialize storage client", e))?;
        Ok((origin, true))
    }

    /// Looks up a cache entry. Cache failures count as misses.
    async fn lookup(&self, key: &str, deadline: Instant) -> Option<CacheEntry> {
        let result = tokio::time::timeout_at(deadline, self.0.cache.get(key)).await;
        let (entry, outcome) = match result {
            Ok(Ok(Some(entry))) if !entry.bytes.is_empty() => (Some(entry), "hit"),
            Ok(Ok(_)) => (None, "miss"),
            Ok(Err(error)) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    key,
                    "cache lookup failed"
                );
                (None, "error")
            }
            Err(_) => {
                tracing::warn!(key, "cache lookup timed out");
                (None, "error")
            }
        };

        merni::counter!(
            "cache.lookup": 1,
            "result" => outcome,
            "cache" => self.0.cache.name()
        );
        entry
    }

    fn cached_response(&self, entry: CacheEntry) -> Delivery {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::CONTENT_TYPE, &entry.content_type);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.bytes.len()));
        self.set_cache_headers(&mut headers, true);

        Delivery {
            status: StatusCode::OK,
            headers,
            body: DeliveryBody::Full(entry.bytes),
            decision: DeliveryDecision::ServeFromCache,
        }
    }

    fn object_headers(&self, object: &ObjectDescriptor, content_length: u64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::CONTENT_TYPE, &object.content_type);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if !object.etag.is_empty() {
            insert_header(&mut headers, header::ETAG, &object.etag);
        }
        headers
    }

    fn set_cache_headers(&self, headers: &mut HeaderMap, from_cache: bool) {
        let from_cache = if from_cache { "true" } else { "false" };
        headers.insert(X_FROM_CACHE, HeaderValue::from_static(from_cache));

        let cache_time = self.0.options.cache_time.as_secs();
        if cache_time > 0 {
            insert_header(
                headers,
                header::CACHE_CONTROL,
                &format!("public, max-age={cache_time}"),
            );
        } else {
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            );
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
            headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
        }
    }
}

/// Runs an origin call under the request deadline.
async fn within<T, E, F>(deadline: Instant, future: F) -> Result<T, DeliveryError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<DeliveryError>,
{
    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(elapsed) => Err(DeliveryError::internal("request timed out", elapsed)),
    }
}

/// Buffers at most `limit` bytes of a payload.
async fn read_to_limit(
    stream: PayloadStream,
    limit: u64,
    deadline: Instant,
) -> Result<Bytes, DeliveryError> {
    let capacity = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut reader = StreamReader::new(stream);
    let mut buf = vec![0; STREAM_BUFFER_SIZE];
    let mut payload = Vec::with_capacity(capacity);

    let copy = copy_bounded(&mut payload, &mut reader, &mut buf, Some(limit));
    match tokio::time::timeout_at(deadline, copy).await {
        Ok(Ok(_)) => Ok(payload.into()),
        Ok(Err(error)) => Err(DeliveryError::internal("failed to read object", error)),
        Err(elapsed) => Err(DeliveryError::internal("request timed out", elapsed)),
    }
}

/// Streams a payload through a transfer task into a response body.
///
/// Origin failures and the deadline abort the body, which truncates the response. A response
/// body dropped by a disconnected client ends the transfer quietly.
fn stream_body(
    stream: PayloadStream,
    limit: Option<u64>,
    expected: u64,
    deadline: Instant,
) -> PayloadStream {
    let (mut sender, rx) = body_channel(BODY_CHANNEL_CAPACITY);

    let transfer = async move {
        let mut reader = StreamReader::new(stream);
        let mut buf = vec![0; STREAM_BUFFER_SIZE];

        let copy = copy_bounded(&mut sender, &mut reader, &mut buf, limit);
        match tokio::time::timeout_at(deadline, copy).await {
            Ok(Ok(written)) if written < expected => {
                tracing::warn!(expected, written, "origin returned fewer bytes than declared");
            }
            Ok(Ok(written)) => {
                merni::distribution!("delivery.streamed"@b: written);
                tracing::debug!(written, "streamed object");
            }
            Ok(Err(error)) if error.is_disconnect() => {
                tracing::info!(written = error.written, "client disconnected during transfer");
            }
            Ok(Err(error)) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    written = error.written,
                    "stream failed"
                );
                sender.abort(error.source).await;
            }
            Err(_) => {
                tracing::error!("transfer exceeded the request deadline");
                let error = std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out");
                sender.abort(error).await;
            }
        }
    };
    tokio::spawn(transfer.in_current_span());

    ReceiverStream::new(rx).boxed()
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!(%name, value, "dropping invalid header value"),
    }
}

/// Sets `Content-Disposition` to download the payload under the key's base name.
fn set_download_headers(headers: &mut HeaderMap, key: &str) {
    let filename: String = key
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();

    let disposition = format!("attachment; filename=\"{filename}\"");
    let value = HeaderValue::from_bytes(disposition.as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, value);
}

fn record(result: &Result<Delivery, DeliveryError>, endpoint: &'static str) {
    let decision = match result {
        Ok(delivery) => delivery.decision,
        Err(error) => DeliveryDecision::Reject(error.reason()),
    };
    merni::counter!(
        "delivery.decision": 1,
        "decision" => decision.as_str(),
        "endpoint" => endpoint
    );
    if let Ok(delivery) = result {
        if let DeliveryBody::Full(bytes) = &delivery.body {
            merni::distribution!(
                "delivery.buffered"@b: bytes.len() as u64,
                "endpoint" => endpoint
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use futures_util::TryStreamExt;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::backend::{
        BackendError, BackendResult, BlobStore, InMemoryBackend, ObjectDescriptor,
    };
    use crate::cache::InMemoryCache;
    use crate::range::ByteRange;

    struct Harness {
        engine: DeliveryEngine,
        origin: InMemoryBackend,
        cache: InMemoryCache,
    }

    fn harness(options: DeliveryOptions) -> Harness {
        let origin = InMemoryBackend::new();
        let cache = InMemoryCache::new();
        let engine = DeliveryEngine::new(
            Arc::new(origin.clone()),
            Arc::new(cache.clone()),
            options,
        );
        Harness {
            engine,
            origin,
            cache,
        }
    }

    fn request(bucket: &str, key: &str) -> DeliveryRequest {
        DeliveryRequest {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn body(delivery: Delivery) -> std::io::Result<Vec<u8>> {
        match delivery.body {
            DeliveryBody::Empty => Ok(Vec::new()),
            DeliveryBody::Full(bytes) => Ok(bytes.to_vec()),
            DeliveryBody::Stream(stream) => crate::stream::read_to_vec(stream).await,
        }
    }

    fn header<'a>(delivery: &'a Delivery, name: &str) -> Option<&'a str> {
        delivery.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test(start_paused = true)]
    async fn small_object_is_cached_after_first_request() {
        let h = harness(DeliveryOptions::default());
        let payload = sample(2048);
        h.origin.insert("mybucket", "a/b.png", "image/png", payload.clone());

        let first = h.engine.deliver(request("mybucket", "a/b.png")).await.unwrap();
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.decision, DeliveryDecision::ServeSmallWithCachePopulate);
        assert_eq!(header(&first, "content-type"), Some("image/png"));
        assert_eq!(header(&first, "content-length"), Some("2048"));
        assert_eq!(header(&first, "x-from-cache"), Some("false"));
        assert_eq!(header(&first, "cache-control"), Some("public, max-age=3600"));
        assert!(header(&first, "etag").is_some());
        assert_eq!(body(first).await.unwrap(), payload);

        h.engine.populator().wait_idle().await;
        let cached = h.cache.peek("cdn:mybucket:a/b.png").unwrap();
        assert_eq!(cached.content_type, "image/png");
        assert_eq!(h.cache.ttl("cdn:mybucket:a/b.png"), Some(DEFAULT_CACHE_TTL));

        let second = h.engine.deliver(request("mybucket", "a/b.png")).await.unwrap();
        assert_eq!(second.decision, DeliveryDecision::ServeFromCache);
        assert_eq!(header(&second, "x-from-cache"), Some("true"));
        assert_eq!(header(&second, "content-type"), Some("image/png"));
        assert_eq!(header(&second, "etag"), None);
        assert_eq!(body(second).await.unwrap(), payload);

        // The hit skipped the origin entirely.
        assert_eq!(h.origin.stat_calls(), 1);
        assert_eq!(h.origin.get_calls(), 1);
    }

    #[tokio::test]
    async fn leading_slash_in_key_is_ignored() {
        let h = harness(DeliveryOptions::default());
        h.origin.insert("media", "a.txt", "text/plain", &b"hello"[..]);

        let delivery = h.engine.deliver(request("media", "/a.txt")).await.unwrap();
        assert_eq!(body(delivery).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn range_is_served_without_cache() {
        let h = harness(DeliveryOptions::default());
        let payload = sample(1000);
        h.origin.insert("media", "video.mp4", "video/mp4", payload.clone());

        let mut req = request("media", "video.mp4");
        req.range = Some("bytes=100-199".into());
        let delivery = h.engine.deliver(req).await.unwrap();

        assert_eq!(delivery.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(delivery.decision, DeliveryDecision::ServeRange);
        assert_eq!(header(&delivery, "content-range"), Some("bytes 100-199/1000"));
        assert_eq!(header(&delivery, "content-length"), Some("100"));
        assert_eq!(header(&delivery, "accept-ranges"), Some("bytes"));
        assert_eq!(body(delivery).await.unwrap(), &payload[100..200]);

        assert_eq!(h.cache.get_calls(), 0);
        assert_eq!(h.cache.set_calls(), 0);
    }

    #[tokio::test]
    async fn unsatisfiable_and_malformed_ranges_are_rejected() {
        let h = harness(DeliveryOptions::default());
        h.origin.insert("media", "a.bin", "application/octet-stream", sample(1000));

        for range in ["bytes=2000-2100", "bytes=0-10,20-30", "lines=1-2"] {
            let mut req = request("media", "a.bin");
            req.range = Some(range.into());
            let err = h.engine.deliver(req).await.unwrap_err();
            assert!(
                matches!(err, DeliveryError::RangeNotSatisfiable { size: 1000 }),
                "{range}"
            );
        }
        assert_eq!(h.origin.get_calls(), 0);
    }

    #[tokio::test]
    async fn threshold_separates_small_from_large() {
        let options = DeliveryOptions {
            small_object_threshold: 1024,
            ..Default::default()
        };
        let h = harness(options);
        h.origin.insert("media", "at.bin", "application/octet-stream", sample(1024));
        h.origin.insert("media", "over.bin", "application/octet-stream", sample(1025));

        let at = h.engine.deliver(request("media", "at.bin")).await.unwrap();
        assert_eq!(at.decision, DeliveryDecision::ServeSmallWithCachePopulate);
        assert!(matches!(at.body, DeliveryBody::Full(_)));

        let over = h.engine.deliver(request("media", "over.bin")).await.unwrap();
        assert_eq!(over.decision, DeliveryDecision::ServeLargeStreamed);
        assert_eq!(header(&over, "content-length"), Some("1025"));
        assert_eq!(header(&over, "x-from-cache"), Some("false"));
        assert!(matches!(over.body, DeliveryBody::Stream(_)));
        assert_eq!(body(over).await.unwrap(), sample(1025));

        h.engine.populator().wait_idle().await;
        assert!(h.cache.peek("cdn:media:at.bin").is_some());
        assert!(h.cache.peek("cdn:media:over.bin").is_none());
    }

    #[tokio::test]
    async fn classify_uses_fifty_mebibyte_boundary() {
        let h = harness(DeliveryOptions::default());
        let e = &h.engine;

        assert_eq!(
            e.classify(false, false, SMALL_OBJECT_THRESHOLD),
            DeliveryDecision::ServeSmallWithCachePopulate
        );
        assert_eq!(
            e.classify(false, false, SMALL_OBJECT_THRESHOLD + 1),
            DeliveryDecision::ServeLargeStreamed
        );
        assert_eq!(e.classify(false, true, 0), DeliveryDecision::ServeFromCache);
        assert_eq!(e.classify(true, true, 0), DeliveryDecision::ServeRange);
    }

    #[tokio::test]
    async fn origin_errors_map_to_rejections() {
        let h = harness(DeliveryOptions::default());
        h.origin.insert("private", "a.txt", "text/plain", &b"secret"[..]);
        h.origin.deny("private");

        let err = h.engine.deliver(request("media", "missing")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound));

        let err = h.engine.deliver(request("private", "a.txt")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Forbidden));

        let mut req = request("private", "a.txt");
        req.range = Some("bytes=0-1".into());
        let err = h.engine.deliver(req).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Forbidden));
    }

    #[tokio::test]
    async fn empty_bucket_or_key_is_a_bad_request() {
        let h = harness(DeliveryOptions::default());

        let err = h.engine.deliver(request("", "a.txt")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::BadRequest("missing bucket parameter")));

        for key in ["", "/"] {
            let err = h.engine.deliver(request("media", key)).await.unwrap_err();
            assert!(matches!(err, DeliveryError::BadRequest("invalid file path")));
        }
        assert_eq!(h.origin.stat_calls(), 0);
    }

    #[tokio::test]
    async fn download_mode_sets_disposition_on_every_path() {
        let options = DeliveryOptions {
            small_object_threshold: 4,
            ..Default::default()
        };
        let h = harness(options);
        h.origin.insert("media", "docs/report.pdf", "application/pdf", &b"pdf"[..]);
        h.origin.insert("media", "docs/big.iso", "application/octet-stream", sample(64));

        let cases = [
            ("docs/report.pdf", None, "report.pdf"),
            ("docs/report.pdf", None, "report.pdf"),
            ("docs/big.iso", None, "big.iso"),
            ("docs/big.iso", Some("bytes=0-9"), "big.iso"),
        ];
        for (key, range, filename) in cases {
            let mut req = request("media", key);
            req.download = true;
            req.range = range.map(Into::into);
            let delivery = h.engine.deliver(req).await.unwrap();
            assert_eq!(
                header(&delivery, "content-disposition"),
                Some(format!("attachment; filename=\"{filename}\"").as_str())
            );
            h.engine.populator().wait_idle().await;
        }

        let plain = h.engine.deliver(request("media", "docs/report.pdf")).await.unwrap();
        assert_eq!(plain.decision, DeliveryDecision::ServeFromCache);
        assert_eq!(header(&plain, "content-disposition"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_cache_time_disables_client_caching() {
        let options = DeliveryOptions {
            cache_time: Duration::ZERO,
            ..Default::default()
        };
        let h = harness(options);
        h.origin.insert("media", "a.txt", "text/plain", &b"hello"[..]);

        let delivery = h.engine.deliver(request("media", "a.txt")).await.unwrap();
        assert_eq!(
            header(&delivery, "cache-control"),
            Some("no-cache, no-store, must-revalidate")
        );
        assert_eq!(header(&delivery, "pragma"), Some("no-cache"));
        assert_eq!(header(&delivery, "expires"), Some("0"));

        // The cache store still keeps the entry for the default time.
        h.engine.populator().wait_idle().await;
        assert_eq!(h.cache.ttl("cdn:media:a.txt"), Some(DEFAULT_CACHE_TTL));
    }

    #[tokio::test]
    async fn credential_override_requires_opt_in() {
        let credentials = Credentials::new("tenant", "s3cr3t");
        let mut req = request("scoped", "a.txt");
        req.credentials = Some(credentials.clone());

        let h = harness(DeliveryOptions::default());
        h.origin.insert("scoped", "a.txt", "text/plain", &b"tenant data"[..]);
        h.origin.restrict("scoped", credentials.clone());

        let err = h.engine.deliver(req.clone()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Forbidden));

        let options = DeliveryOptions {
            allow_credential_override: true,
            ..Default::default()
        };
        let h = harness(options);
        h.origin.insert("scoped", "a.txt", "text/plain", &b"tenant data"[..]);
        h.origin.restrict("scoped", credentials);

        for _ in 0..2 {
            let delivery = h.engine.deliver(req.clone()).await.unwrap();
            assert_eq!(delivery.decision, DeliveryDecision::ServeSmallWithCachePopulate);
            assert_eq!(body(delivery).await.unwrap(), b"tenant data");
        }

        // Scoped requests neither read nor write the cache.
        h.engine.populator().wait_idle().await;
        assert_eq!(h.cache.get_calls(), 0);
        assert_eq!(h.cache.set_calls(), 0);
    }

    #[tokio::test]
    async fn empty_objects_are_served_but_not_cached() {
        let h = harness(DeliveryOptions::default());
        h.origin.insert("media", "empty.txt", "text/plain", Bytes::new());

        let delivery = h.engine.deliver(request("media", "empty.txt")).await.unwrap();
        assert_eq!(delivery.status, StatusCode::OK);
        assert_eq!(header(&delivery, "content-length"), Some("0"));
        assert!(matches!(delivery.body, DeliveryBody::Empty));

        h.engine.populator().wait_idle().await;
        assert_eq!(h.cache.set_calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_cache_does_not_fail_requests() {
        let h = harness(DeliveryOptions::default());
        h.origin.insert("media", "a.txt", "text/plain", &b"hello"[..]);
        h.cache.set_unavailable(true);

        for _ in 0..2 {
            let delivery = h.engine.deliver(request("media", "a.txt")).await.unwrap();
            assert_eq!(header(&delivery, "x-from-cache"), Some("false"));
            assert_eq!(body(delivery).await.unwrap(), b"hello");
            h.engine.populator().wait_idle().await;
        }
        assert_eq!(h.origin.get_calls(), 2);
    }

    /// An origin with scripted failures.
    #[derive(Debug)]
    struct FaultyOrigin {
        declared_size: u64,
        payload: Bytes,
        fail_after_payload: bool,
        stall: bool,
    }

    impl FaultyOrigin {
        fn new(declared_size: u64, payload: &[u8]) -> Self {
            Self {
                declared_size,
                payload: Bytes::copy_from_slice(payload),
                fail_after_payload: false,
                stall: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for FaultyOrigin {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn stat(&self, _bucket: &str, _key: &str) -> BackendResult<ObjectDescriptor> {
            Ok(ObjectDescriptor {
                size: self.declared_size,
                content_type: "application/octet-stream".into(),
                etag: String::new(),
            })
        }

        async fn get(
            &self,
            _bucket: &str,
            _key: &str,
            _range: Option<ByteRange>,
        ) -> BackendResult<PayloadStream> {
            let mut items = vec![Ok(self.payload.clone())];
            if self.fail_after_payload {
                items.push(Err(std::io::Error::other("origin reset")));
            }
            let stream = futures_util::stream::iter(items);
            if self.stall {
                Ok(stream.chain(futures_util::stream::pending()).boxed())
            } else {
                Ok(stream.boxed())
            }
        }

        fn with_credentials(&self, _credentials: &Credentials) -> BackendResult<SharedBlobStore> {
            Err(BackendError::Unsupported("credentials"))
        }
    }

    fn faulty_engine(origin: FaultyOrigin, options: DeliveryOptions) -> DeliveryEngine {
        DeliveryEngine::new(Arc::new(origin), Arc::new(InMemoryCache::new()), options)
    }

    #[tokio::test]
    async fn short_origin_body_is_served_as_is() {
        let engine = faulty_engine(FaultyOrigin::new(100, &sample(60)), Default::default());

        let delivery = engine.deliver(request("media", "short")).await.unwrap();
        assert_eq!(header(&delivery, "content-length"), Some("60"));
        assert_eq!(body(delivery).await.unwrap(), sample(60));
    }

    #[tokio::test]
    async fn stream_failure_truncates_body() {
        let mut origin = FaultyOrigin::new(1000, &sample(300));
        origin.fail_after_payload = true;
        let options = DeliveryOptions {
            small_object_threshold: 10,
            ..Default::default()
        };
        let engine = faulty_engine(origin, options);

        let delivery = engine.deliver(request("media", "large")).await.unwrap();
        assert_eq!(delivery.status, StatusCode::OK);
        assert_eq!(header(&delivery, "content-length"), Some("1000"));

        let DeliveryBody::Stream(stream) = delivery.body else {
            panic!("expected a streamed body");
        };
        let chunks: Vec<_> = stream.collect().await;
        let received: usize = chunks
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .map(|c| c.len())
            .sum();
        assert_eq!(received, 300);
        assert!(chunks.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn small_path_read_failure_is_internal() {
        let mut origin = FaultyOrigin::new(1000, &sample(300));
        origin.fail_after_payload = true;
        let engine = faulty_engine(origin, Default::default());

        let err = engine.deliver(request("media", "small")).await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_origin_hits_the_deadline() {
        let mut origin = FaultyOrigin::new(1000, &sample(10));
        origin.stall = true;
        let options = DeliveryOptions {
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = faulty_engine(origin, options.clone());

        let err = engine.deliver(request("media", "small")).await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::Internal);

        let mut origin = FaultyOrigin::new(1000, &sample(10));
        origin.stall = true;
        let engine = faulty_engine(
            origin,
            DeliveryOptions {
                small_object_threshold: 1,
                ..options
            },
        );
        let delivery = engine.deliver(request("media", "large")).await.unwrap();
        let DeliveryBody::Stream(stream) = delivery.body else {
            panic!("expected a streamed body");
        };
        let result: std::io::Result<Vec<Bytes>> = stream.try_collect().await;
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::TimedOut
        );
    }

    fn noise_png(width: u32, height: u32) -> Vec<u8> {
        let mut state = 0x9e37_79b9_u32;
        let image = RgbImage::from_fn(width, height, |_, _| {
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            };
            Rgb([next(), next(), next()])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn image_options() -> DeliveryOptions {
        DeliveryOptions {
            image_bucket: "images".into(),
            image_budget: 60 * 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn oversized_image_is_recompressed_and_cached() {
        let h = harness(image_options());
        let raw = noise_png(256, 256);
        assert!(raw.len() > 60 * 1024);
        h.origin.insert("images", "photos/cat.png", "image/png", raw);

        let request = ImageRequest {
            key: "/photos/cat.png".into(),
        };
        let first = h.engine.deliver_image(request.clone()).await.unwrap();
        assert_eq!(header(&first, "x-compressed"), Some("true"));
        assert_eq!(header(&first, "x-from-cache"), Some("false"));
        assert_eq!(header(&first, "content-type"), Some("image/png"));
        let compressed = body(first).await.unwrap();
        assert!(compressed.len() <= 60 * 1024);

        h.engine.populator().wait_idle().await;
        let second = h.engine.deliver_image(request).await.unwrap();
        assert_eq!(header(&second, "x-from-cache"), Some("true"));
        assert_eq!(header(&second, "x-compressed"), None);
        assert_eq!(body(second).await.unwrap(), compressed);
        assert_eq!(h.origin.get_calls(), 1);
    }

    #[tokio::test]
    async fn small_and_vector_images_are_cached_verbatim() {
        let h = harness(image_options());
        let svg = format!("<svg>{}</svg>", "x".repeat(70 * 1024));
        h.origin.insert("images", "logo.svg", "image/svg+xml", svg.clone());
        h.origin.insert("images", "icon.png", "image/png", &b"\x89PNG tiny"[..]);

        let cases = [("logo.svg", svg.as_bytes()), ("icon.png", &b"\x89PNG tiny"[..])];
        for (key, expected) in cases {
            let request = ImageRequest { key: key.into() };
            let delivery = h.engine.deliver_image(request).await.unwrap();
            assert_eq!(header(&delivery, "x-compressed"), None);
            assert_eq!(body(delivery).await.unwrap(), expected);
        }

        h.engine.populator().wait_idle().await;
        let cached = h.cache.peek("compressed:logo.svg").unwrap();
        assert_eq!(cached.bytes.as_ref(), svg.as_bytes());
        assert_eq!(cached.content_type, "image/svg+xml");
    }

    #[tokio::test]
    async fn undecodable_image_falls_back_to_original() {
        let h = harness(image_options());
        let garbage = sample(80 * 1024);
        h.origin.insert("images", "broken.jpg", "image/jpeg", garbage.clone());

        let request = ImageRequest {
            key: "broken.jpg".into(),
        };
        let delivery = h.engine.deliver_image(request).await.unwrap();
        assert_eq!(header(&delivery, "x-compressed"), None);
        assert_eq!(header(&delivery, "content-type"), Some("image/jpeg"));
        assert_eq!(body(delivery).await.unwrap(), garbage);
    }

    #[tokio::test]
    async fn recompression_past_deadline_keeps_original() {
        let h = harness(image_options());
        let entry = CacheEntry::new(noise_png(256, 256), "image/png");

        assert!(h.engine.recompress(&entry, Instant::now()).await.is_none());
        assert!(
            h.engine
                .recompress(&entry, Instant::now() + Duration::from_secs(60))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn images_above_fetch_limit_are_rejected() {
        let options = DeliveryOptions {
            max_image_fetch: 1024,
            ..image_options()
        };
        let h = harness(options);
        h.origin.insert("images", "huge.png", "image/png", sample(1025));

        let request = ImageRequest {
            key: "huge.png".into(),
        };
        let err = h.engine.deliver_image(request).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::UpstreamTooLarge {
                size: 1025,
                limit: 1024
            }
        ));
        assert_eq!(h.origin.get_calls(), 0);

        let err = h
            .engine
            .deliver_image(ImageRequest { key: "/".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::BadRequest(_)));
    }
}
