use std::fmt;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;

use crate::PayloadStream;
use crate::backend::common::{
    BackendError, BackendResult, BlobStore, Credentials, DEFAULT_CONTENT_TYPE, ObjectDescriptor,
    SharedBlobStore,
};
use crate::range::ByteRange;

/// Service error codes that indicate the caller is not allowed to read an object.
const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
];

/// Service error codes that indicate a missing object or bucket.
const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NotFound", "NoSuchBucket"];

/// Connection settings for an S3-compatible origin, such as Cloudflare R2 or MinIO.
#[derive(Clone, Debug)]
pub struct S3CompatibleConfig {
    /// Endpoint URL, for example `https://<account>.r2.cloudflarestorage.com`.
    pub endpoint: String,
    /// Signing region. R2 expects `auto`.
    pub region: String,
    /// Use path-style addressing (`endpoint/bucket/key`) instead of virtual hosts.
    pub path_style: bool,
    /// Static credentials. Falls back to the default AWS credential chain if unset.
    pub credentials: Option<Credentials>,
}

/// A [`BlobStore`] backed by any service speaking the S3 API.
pub struct S3CompatibleBackend {
    client: Client,
    sdk_config: SdkConfig,
    config: S3CompatibleConfig,
}

impl S3CompatibleBackend {
    /// Creates a backend for the given origin.
    pub async fn new(config: S3CompatibleConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint);

        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(to_sdk_credentials(credentials));
        }

        let sdk_config = loader.load().await;
        let client = build_client(&sdk_config, &config, None);

        Self {
            client,
            sdk_config,
            config,
        }
    }
}

fn to_sdk_credentials(credentials: &Credentials) -> aws_credential_types::Credentials {
    aws_credential_types::Credentials::new(
        &credentials.access_key,
        &credentials.secret_key,
        None,
        None,
        "edgecache",
    )
}

fn build_client(
    sdk_config: &SdkConfig,
    config: &S3CompatibleConfig,
    credentials: Option<&Credentials>,
) -> Client {
    let mut builder =
        aws_sdk_s3::config::Builder::from(sdk_config).force_path_style(config.path_style);
    if let Some(credentials) = credentials {
        builder = builder.credentials_provider(to_sdk_credentials(credentials));
    }
    Client::from_conf(builder.build())
}

/// Classifies an SDK error into the origin error taxonomy.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, context: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code();

    if status == Some(403) || code.is_some_and(|c| ACCESS_DENIED_CODES.contains(&c)) {
        return BackendError::AccessDenied;
    }
    if status == Some(404) || code.is_some_and(|c| NOT_FOUND_CODES.contains(&c)) {
        return BackendError::NotFound;
    }

    BackendError::Generic {
        context: context.to_owned(),
        cause: Box::new(err),
    }
}

impl fmt::Debug for S3CompatibleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Compatible")
            .field("endpoint", &self.config.endpoint)
            .field("region", &self.config.region)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BlobStore for S3CompatibleBackend {
    fn name(&self) -> &'static str {
        "s3-compatible"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn stat(&self, bucket: &str, key: &str) -> BackendResult<ObjectDescriptor> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "failed to stat object"))?;

        Ok(ObjectDescriptor {
            size: output
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or_default(),
            content_type: output
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_owned(),
            etag: output.e_tag().unwrap_or_default().to_owned(),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<PayloadStream> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = range {
            request = request.range(range.to_header());
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, "failed to get object"))?;

        let reader = output.body.into_async_read();
        Ok(ReaderStream::new(reader).boxed())
    }

    fn with_credentials(&self, credentials: &Credentials) -> BackendResult<SharedBlobStore> {
        let client = build_client(&self.sdk_config, &self.config, Some(credentials));
        Ok(Arc::new(Self {
            client,
            sdk_config: self.sdk_config.clone(),
            config: S3CompatibleConfig {
                credentials: Some(credentials.clone()),
                ..self.config.clone()
            },
        }))
    }
}
