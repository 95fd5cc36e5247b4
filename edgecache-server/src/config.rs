//! Configuration for the edgecache server.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `EC__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `EC__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `EC__HTTP_ADDR=0.0.0.0:8080` sets the HTTP server address
//! - `EC__ORIGIN__ENDPOINT=https://<account>.r2.cloudflarestorage.com` sets the origin endpoint
//! - `EC__CACHE__REDIS_URL=redis://cache:6379/0` sets the cache store
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! http_addr: 0.0.0.0:8080
//!
//! origin:
//!   endpoint: https://<account>.r2.cloudflarestorage.com
//!
//! cache:
//!   redis_url: redis://cache:6379/0
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use bytesize::ByteSize;
use edgecache_service::DeliveryOptions;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "EC__";

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// The S3-compatible origin holding the authoritative objects.
///
/// Both Cloudflare R2 and self-hosted MinIO are supported through the same S3 API.
///
/// Used in: [`Config::origin`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Origin {
    /// Endpoint URL of the origin.
    ///
    /// # Default
    ///
    /// `http://localhost:9000`
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__ENDPOINT`
    pub endpoint: String,

    /// Signing region. Cloudflare R2 expects `auto`.
    ///
    /// # Default
    ///
    /// `auto`
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__REGION`
    pub region: String,

    /// Bucket that image requests are served from.
    ///
    /// # Default
    ///
    /// `default-bucket`
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__BUCKET`
    pub bucket: String,

    /// Access key ID for the origin.
    ///
    /// When unset, credentials are resolved from the default AWS credential chain.
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__ACCESS_KEY`
    pub access_key: Option<String>,

    /// Secret access key for the origin. Only used together with `access_key`.
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__SECRET_KEY`
    pub secret_key: Option<SecretBox<ConfigSecret>>,

    /// Use path-style addressing, as required by most MinIO deployments.
    ///
    /// # Default
    ///
    /// `true`
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__PATH_STYLE`
    pub path_style: bool,

    /// Honor `access_key`/`secret_key` query parameters on object requests.
    ///
    /// Requests with their own credentials bypass the cache entirely. When disabled, the query
    /// parameters are ignored.
    ///
    /// # Default
    ///
    /// `false`
    ///
    /// # Environment Variable
    ///
    /// `EC__ORIGIN__ALLOW_CREDENTIAL_OVERRIDE`
    pub allow_credential_override: bool,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_owned(),
            region: "auto".to_owned(),
            bucket: "default-bucket".to_owned(),
            access_key: None,
            secret_key: None,
            path_style: true,
            allow_credential_override: false,
        }
    }
}

/// Cache store configuration.
///
/// Used in: [`Config::cache`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Cache {
    /// Redis connection URL, including password and database if needed.
    ///
    /// # Default
    ///
    /// `redis://localhost:6379`
    ///
    /// # Environment Variable
    ///
    /// `EC__CACHE__REDIS_URL`
    pub redis_url: String,

    /// How long clients may cache responses, also used as the cache entry TTL.
    ///
    /// A value of `0s` instructs clients not to cache responses. Cache entries then fall back to
    /// a TTL of one hour.
    ///
    /// # Default
    ///
    /// `1h`
    ///
    /// # Environment Variable
    ///
    /// `EC__CACHE__CACHE_TIME`
    #[serde(with = "humantime_serde")]
    pub cache_time: Duration,

    /// Upper bound for a single background cache write.
    ///
    /// # Default
    ///
    /// `30s`
    ///
    /// # Environment Variable
    ///
    /// `EC__CACHE__POPULATE_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub populate_timeout: Duration,

    /// Maximum number of background cache writes in flight. Further writes are skipped.
    ///
    /// # Default
    ///
    /// `256`
    ///
    /// # Environment Variable
    ///
    /// `EC__CACHE__MAX_PENDING_WRITES`
    pub max_pending_writes: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_owned(),
            cache_time: Duration::from_secs(3600),
            populate_timeout: Duration::from_secs(30),
            max_pending_writes: 256,
        }
    }
}

/// Size and time limits for serving requests.
///
/// Used in: [`Config::limits`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Objects up to this size are buffered and cached, larger objects are streamed.
    ///
    /// # Default
    ///
    /// `50 MiB`
    ///
    /// # Environment Variable
    ///
    /// `EC__LIMITS__SMALL_OBJECT_THRESHOLD`
    pub small_object_threshold: ByteSize,

    /// Images larger than this are recompressed before they are cached.
    ///
    /// # Default
    ///
    /// `100 KiB`
    ///
    /// # Environment Variable
    ///
    /// `EC__LIMITS__IMAGE_BUDGET`
    pub image_budget: ByteSize,

    /// Recompressed images are scaled down to at most this width in pixels.
    ///
    /// # Default
    ///
    /// `1024`
    ///
    /// # Environment Variable
    ///
    /// `EC__LIMITS__IMAGE_MAX_WIDTH`
    pub image_max_width: u32,

    /// Images larger than this at the origin are rejected.
    ///
    /// # Default
    ///
    /// `10 MiB`
    ///
    /// # Environment Variable
    ///
    /// `EC__LIMITS__MAX_IMAGE_FETCH`
    pub max_image_fetch: ByteSize,

    /// Deadline for fetching an object from the origin, including streaming its body.
    ///
    /// # Default
    ///
    /// `300s`
    ///
    /// # Environment Variable
    ///
    /// `EC__LIMITS__REQUEST_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            small_object_threshold: ByteSize::mib(50),
            image_budget: ByteSize::kib(100),
            image_max_width: 1024,
            max_image_fetch: ByteSize::mib(10),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Runtime configuration for the Tokio async runtime.
///
/// Used in: [`Config::runtime`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads for the server runtime.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `EC__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,

    /// Interval for reporting internal runtime metrics.
    ///
    /// Defaults to `10s`.
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

/// [Sentry](https://sentry.io/) error tracking and performance monitoring configuration.
///
/// Sentry is disabled by default and only enabled when a DSN is provided.
///
/// Used in: [`Config::sentry`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN (Data Source Name).
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name for this deployment, such as `production`.
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Server name or identifier, typically the hostname or pod name.
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__SERVER_NAME`
    pub server_name: Option<Cow<'static, str>>,

    /// Error event sampling rate.
    ///
    /// # Default
    ///
    /// `1.0` (send all errors)
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__SAMPLE_RATE`
    pub sample_rate: f32,

    /// Performance trace sampling rate.
    ///
    /// Every delivery is a transaction, so keep this low on busy edges.
    ///
    /// # Default
    ///
    /// `0.01` (send 1% of traces)
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__TRACES_SAMPLE_RATE`
    pub traces_sample_rate: f32,

    /// Whether to inherit sampling decisions from incoming traces.
    ///
    /// # Default
    ///
    /// `true`
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__INHERIT_SAMPLING_DECISION`
    pub inherit_sampling_decision: bool,

    /// Enable Sentry SDK debug mode.
    ///
    /// # Default
    ///
    /// `false`
    ///
    /// # Environment Variable
    ///
    /// `EC__SENTRY__DEBUG`
    pub debug: bool,

    /// Additional tags to attach to all Sentry events.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually:
    /// - `EC__SENTRY__TAGS__FOO=foo`
    /// - `EC__SENTRY__TAGS__BAR=bar`
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            inherit_sampling_decision: true,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  edgecache_server::web::server > HTTP server listening on 0.0.0.0:8080
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2025-06-04T12:10:32Z INFO edgecache_server::web::server: HTTP server listening on 0.0.0.0:8080
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `EC__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `EC__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Metrics configuration.
///
/// Configures submission of internal metrics to Datadog.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Datadog API key. Metrics are only reported when this is set.
    ///
    /// # Environment Variable
    ///
    /// `EC__METRICS__DATADOG_KEY`
    pub datadog_key: Option<SecretBox<ConfigSecret>>,

    /// Global tags applied to all metrics.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually:
    /// - `EC__METRICS__TAGS__FOO=foo`
    /// - `EC__METRICS__TAGS__BAR=bar`
    pub tags: BTreeMap<String, String>,
}

/// Main configuration struct for the edgecache server.
///
/// Configuration is loaded with the following precedence (highest to lowest):
/// 1. Environment variables (prefixed with `EC__`)
/// 2. YAML configuration file (if provided via `-c` flag)
/// 3. Default values
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server bind address.
    ///
    /// # Default
    ///
    /// `0.0.0.0:8080`
    ///
    /// # Environment Variable
    ///
    /// `EC__HTTP_ADDR`
    pub http_addr: SocketAddr,

    /// The origin blob store. See [`Origin`].
    pub origin: Origin,

    /// The cache store and background population. See [`Cache`].
    pub cache: Cache,

    /// Size and time limits. See [`Limits`].
    pub limits: Limits,

    /// Configuration of the internal task runtime. See [`Runtime`].
    pub runtime: Runtime,

    /// Logging configuration. See [`Logging`].
    pub logging: Logging,

    /// Sentry error tracking configuration. See [`Sentry`].
    pub sentry: Sentry,

    /// Internal metrics configuration. See [`Metrics`].
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            origin: Origin::default(),
            cache: Cache::default(),
            limits: Limits::default(),
            runtime: Runtime::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `EC__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML configuration file cannot be read or parsed, or if
    /// environment variables contain invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Returns the options for the delivery engine.
    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            small_object_threshold: self.limits.small_object_threshold.as_u64(),
            cache_time: self.cache.cache_time,
            populate_timeout: self.cache.populate_timeout,
            max_pending_writes: self.cache.max_pending_writes,
            image_bucket: self.origin.bucket.clone(),
            image_budget: self.limits.image_budget.as_u64(),
            image_max_width: self.limits.image_max_width,
            max_image_fetch: self.limits.max_image_fetch.as_u64(),
            request_timeout: self.limits.request_timeout,
            allow_credential_override: self.origin.allow_credential_override,
        }
    }

    /// Returns the static origin credentials, if both keys are configured.
    pub fn origin_credentials(&self) -> Option<edgecache_service::backend::Credentials> {
        let access_key = self.origin.access_key.as_deref()?;
        let secret_key = self.origin.secret_key.as_ref()?;
        Some(edgecache_service::backend::Credentials::new(
            access_key,
            secret_key.expose_secret().as_str(),
        ))
    }
}
