//! Bookkeeping for cache writes that outlive their request.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// A bounded count of in-flight cache writes.
///
/// Clones share the same count.
#[derive(Clone, Debug)]
pub(crate) struct PendingWrites {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    count: AtomicUsize,
    max: usize,
    drained: Notify,
}

impl PendingWrites {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                count: AtomicUsize::new(0),
                max,
                drained: Notify::new(),
            }),
        }
    }

    /// Reserves a slot for one write, or `None` if `max` writes are already pending.
    pub(crate) fn try_reserve(&self) -> Option<WriteSlot> {
        let max = self.inner.max;
        self.inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;

        Some(WriteSlot {
            inner: Arc::clone(&self.inner),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Resolves once every reserved slot has been released.
    pub(crate) async fn drained(&self) {
        loop {
            // Registered before the check so a release in between is not missed.
            let notified = self.inner.drained.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A reserved write slot, released on drop.
#[derive(Debug)]
pub(crate) struct WriteSlot {
    inner: Arc<Inner>,
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}
