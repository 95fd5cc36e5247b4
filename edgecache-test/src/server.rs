//! Exposes an in-process test server for use in integration tests.
//!
//! ```
//! use edgecache_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = TestServer::new().await;
//!    server.origin().insert("bucket", "hello.txt", "text/plain", "hello");
//!    let url = server.url("/bucket/hello.txt");
//!    // use the URL in tests...
//! }
//! ```

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use edgecache_server::config::Config;
use edgecache_server::state::State;
use edgecache_server::web::App;
use edgecache_service::DeliveryEngine;
use edgecache_service::backend::InMemoryBackend;
use edgecache_service::cache::InMemoryCache;

/// An in-process test server for use in integration tests.
///
/// This server runs the full edgecache application against an in-memory origin and an in-memory
/// cache, both of which can be inspected and modified through the server. It listens on a random
/// available port on localhost.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    origin: InMemoryBackend,
    cache: InMemoryCache,
    engine: DeliveryEngine,
}

impl TestServer {
    /// Starts a test server with the default configuration.
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    /// Starts a test server with the given configuration.
    ///
    /// The origin and cache settings of the configuration are ignored.
    pub async fn with_config(config: Config) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let origin = InMemoryBackend::new();
        let cache = InMemoryCache::new();

        let state = State::from_parts(config, Arc::new(origin.clone()), Arc::new(cache.clone()));
        let engine = state.engine.clone();
        let app = App::new(state);

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            app.serve(listener).await.unwrap();
        });

        Self {
            handle,
            socket,
            origin,
            cache,
            engine,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// The origin serving this server's objects.
    pub fn origin(&self) -> &InMemoryBackend {
        &self.origin
    }

    /// The cache used by this server.
    pub fn cache(&self) -> &InMemoryCache {
        &self.cache
    }

    /// Waits until all background cache writes have completed.
    pub async fn wait_cache_idle(&self) {
        self.engine.populator().wait_idle().await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
