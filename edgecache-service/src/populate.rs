//! Background cache population.
//!
//! After a response has been produced, the fetched bytes are written to the cache by a tracked
//! task that outlives the request. The request path never waits for these writes. Each write
//! has its own timeout and the number of pending writes is bounded, so a slow or unreachable
//! cache cannot accumulate unbounded work.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::{CacheEntry, SharedCacheStore};
use crate::concurrency::PendingWrites;

/// How often [`CachePopulator::run_emitter`] reports the pending count.
const EMITTER_INTERVAL: Duration = Duration::from_secs(1);

/// The result of a single cache write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// The entry was written to the cache.
    Stored,
    /// The cache returned an error.
    Failed,
    /// The write did not finish within the populate timeout.
    TimedOut,
    /// The write was not attempted because too many writes were pending.
    Skipped,
}

impl PopulateOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
        }
    }
}

/// Settings for [`CachePopulator`].
#[derive(Clone, Copy, Debug)]
pub struct PopulateOptions {
    /// Time to live of written entries.
    pub ttl: Duration,
    /// Upper bound for a single write, independent of any request.
    pub timeout: Duration,
    /// Maximum number of writes in flight at once.
    pub max_pending: usize,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            timeout: Duration::from_secs(30),
            max_pending: 256,
        }
    }
}

/// Submits cache writes as tracked background tasks.
#[derive(Clone, Debug)]
pub struct CachePopulator {
    cache: SharedCacheStore,
    options: PopulateOptions,
    pending: PendingWrites,
}

impl CachePopulator {
    /// Creates a populator writing to `cache`.
    pub fn new(cache: SharedCacheStore, options: PopulateOptions) -> Self {
        Self {
            cache,
            options,
            pending: PendingWrites::new(options.max_pending),
        }
    }

    /// Schedules a write of `entry` under `key` and returns immediately.
    ///
    /// Returns `None` if nothing was scheduled, either because the payload is empty or because
    /// the maximum number of pending writes has been reached.
    pub fn submit(&self, key: String, entry: CacheEntry) -> Option<JoinHandle<PopulateOutcome>> {
        if entry.bytes.is_empty() {
            tracing::debug!(%key, "not caching empty payload");
            return None;
        }

        let Some(slot) = self.pending.try_reserve() else {
            tracing::warn!(%key, "too many pending cache writes, skipping");
            record(PopulateOutcome::Skipped, self.cache.name());
            return None;
        };

        let cache = self.cache.clone();
        let PopulateOptions { ttl, timeout, .. } = self.options;

        Some(tokio::spawn(async move {
            let _slot = slot;
            let size = entry.bytes.len();

            let outcome = match tokio::time::timeout(timeout, cache.set(&key, entry, ttl)).await {
                Ok(Ok(())) => {
                    tracing::debug!(%key, size, "populated cache");
                    PopulateOutcome::Stored
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        %key,
                        "failed to populate cache"
                    );
                    PopulateOutcome::Failed
                }
                Err(_) => {
                    tracing::warn!(%key, ?timeout, "cache write timed out");
                    PopulateOutcome::TimedOut
                }
            };

            record(outcome, cache.name());
            outcome
        }))
    }

    /// Returns the number of writes currently in flight.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Resolves once all submitted writes have finished.
    pub async fn wait_idle(&self) {
        self.pending.drained().await
    }

    /// Periodically emits the number of pending writes as a gauge.
    ///
    /// This future runs forever and is intended to be spawned alongside the server.
    pub async fn run_emitter(&self) {
        let mut ticker = tokio::time::interval(EMITTER_INTERVAL);
        loop {
            ticker.tick().await;
            merni::gauge!("cache.populate.pending": self.pending());
        }
    }
}

fn record(outcome: PopulateOutcome, cache: &'static str) {
    merni::counter!(
        "cache.populate": 1,
        "outcome" => outcome.as_str(),
        "cache" => cache
    );
}
