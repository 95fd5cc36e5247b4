use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use edgecache_service::DeliveryEngine;
use edgecache_service::backend::{S3CompatibleBackend, S3CompatibleConfig, SharedBlobStore};
use edgecache_service::cache::{RedisCache, SharedCacheStore};
use tokio::runtime::Handle;

use crate::config::Config;

/// Shared reference to the edgecache [service state](State).
pub type ServiceState = Arc<State>;

/// Reference to the delivery logic and its configuration.
///
/// This structure is created during server startup and shared with all HTTP request handlers.
///
/// In request handlers, use `axum::extract::State<ServiceState>` to retrieve a shared reference to
/// this structure.
#[derive(Debug)]
pub struct State {
    /// The server configuration.
    pub config: Config,
    /// The delivery engine serving all requests.
    pub engine: DeliveryEngine,
}

impl State {
    /// Connects to the configured origin and cache and spawns background tasks.
    pub async fn new(config: Config) -> anyhow::Result<ServiceState> {
        let origin = S3CompatibleBackend::new(S3CompatibleConfig {
            endpoint: config.origin.endpoint.clone(),
            region: config.origin.region.clone(),
            path_style: config.origin.path_style,
            credentials: config.origin_credentials(),
        })
        .await;

        let cache = RedisCache::new(&config.cache.redis_url)
            .context("failed to create cache connection pool")?;

        tracing::info!(
            origin = %config.origin.endpoint,
            bucket = %config.origin.bucket,
            "Connected to origin and cache"
        );

        Ok(Self::from_parts(config, Arc::new(origin), Arc::new(cache)))
    }

    /// Creates the state from an explicit origin and cache.
    ///
    /// Spawns runtime and cache population metrics, so this must be called within a tokio
    /// runtime.
    pub fn from_parts(
        config: Config,
        origin: SharedBlobStore,
        cache: SharedCacheStore,
    ) -> ServiceState {
        tokio::spawn(track_runtime_metrics(config.runtime.metrics_interval));

        let engine = DeliveryEngine::new(origin, cache, config.delivery_options());

        let populator = engine.populator().clone();
        tokio::spawn(async move { populator.run_emitter().await });

        Arc::new(Self { config, engine })
    }
}

/// Periodically captures and reports internal Tokio runtime metrics.
async fn track_runtime_metrics(interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let metrics = Handle::current().metrics();

    loop {
        ticker.tick().await;
        tracing::trace!("Capturing runtime metrics");

        merni::gauge!("runtime.num_workers": metrics.num_workers());
        merni::gauge!("runtime.num_alive_tasks": metrics.num_alive_tasks());
        merni::gauge!("runtime.global_queue_depth": metrics.global_queue_depth());
    }
}
