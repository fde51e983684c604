use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counts chunk flushes that have been queued but not yet committed.
///
/// One tracker is shared by every write handle opened through the same
/// `Cfs`, so a caller can wait for all outstanding writes of the process
/// before exiting.
#[derive(Debug, Default)]
pub struct FlushTracker {
    pending: AtomicUsize,
    failed: AtomicUsize,
    idle: Notify,
}

impl FlushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Flushes given up on after a failed commit.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueued(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn committed(&self) {
        self.release(1);
    }

    /// Release flushes that will never commit so waiters are not stranded.
    pub(crate) fn abandoned(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.failed.fetch_add(count, Ordering::SeqCst);
        self.release(count);
    }

    fn release(&self, count: usize) {
        let previous = self.pending.fetch_sub(count, Ordering::SeqCst);
        debug_assert!(previous >= count, "flush tracker underflow");
        if previous == count {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no flush is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// The pair of trackers a write handle reports to: its own, so `flush` can
/// wait for just that handle, and the process-wide one.
#[derive(Debug, Clone)]
pub struct FlushScope {
    handle: Arc<FlushTracker>,
    process: Arc<FlushTracker>,
}

impl FlushScope {
    pub fn new(process: Arc<FlushTracker>) -> Self {
        Self {
            handle: Arc::new(FlushTracker::new()),
            process,
        }
    }

    pub fn handle(&self) -> &FlushTracker {
        &self.handle
    }

    pub fn process(&self) -> &FlushTracker {
        &self.process
    }

    pub(crate) fn enqueued(&self) {
        self.handle.enqueued();
        self.process.enqueued();
    }

    pub(crate) fn committed(&self) {
        self.handle.committed();
        self.process.committed();
    }

    pub(crate) fn abandoned(&self, count: usize) {
        self.handle.abandoned(count);
        self.process.abandoned(count);
    }
}
