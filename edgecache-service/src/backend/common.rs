use std::fmt;
use std::sync::Arc;

use crate::PayloadStream;
use crate::range::ByteRange;
use thiserror::Error;

/// Content type reported for objects that the origin stores without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A shared, type-erased [`BlobStore`] instance.
pub type SharedBlobStore = Arc<dyn BlobStore>;

/// Metadata about an object at the origin, as returned by a `HEAD` request.
///
/// This is a snapshot and may be stale with respect to concurrent writes at the origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Size of the object in bytes.
    pub size: u64,
    /// The content type stored with the object.
    pub content_type: String,
    /// The entity tag of the object, including quotes if the origin sends them.
    pub etag: String,
}

/// Access credentials for an origin.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The access key ID.
    pub access_key: String,
    /// The secret access key.
    pub secret_key: String,
}

impl Credentials {
    /// Creates credentials from a key pair.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

/// The origin blob store holding the authoritative object bytes.
///
/// Implementations must be safe for concurrent use by many requests.
#[async_trait::async_trait]
pub trait BlobStore: fmt::Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Retrieves the metadata of an object without its payload.
    async fn stat(&self, bucket: &str, key: &str) -> BackendResult<ObjectDescriptor>;

    /// Streams the payload of an object, or only the given byte range of it.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<PayloadStream>;

    /// Returns a handle to the same origin that authenticates with the given credentials.
    fn with_credentials(&self, credentials: &Credentials) -> BackendResult<SharedBlobStore>;
}

/// Errors returned by [`BlobStore`] implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The object does not exist at the origin.
    #[error("object not found")]
    NotFound,

    /// The origin refused access to the object.
    #[error("access denied")]
    AccessDenied,

    /// The operation is not available on this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// IO errors related to payload streaming.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error stemming from the origin, which might be specific to the backend or to a
    /// certain operation.
    #[error("storage backend error: {context}")]
    Generic {
        /// What the backend was doing.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
