//! Tracking of operations submitted to the native layer.
//!
//! Close must not release the handle while an operation can still complete
//! against it. Each submitted operation holds a [`PendingGuard`] until it
//! completes, and [`PendingOperations::wait_idle`] blocks until none remain.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct PendingOperations {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingOperations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one in-flight operation.
    pub fn begin(self: &Arc<Self>) -> PendingGuard {
        *self.count.lock() += 1;
        PendingGuard {
            pending: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until every registered operation has completed.
    pub fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) with an upper bound. Returns true
    /// when idle was reached.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Registration of a single in-flight operation; dropping it completes it.
#[derive(Debug)]
pub struct PendingGuard {
    pending: Arc<PendingOperations>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.finish();
    }
}
