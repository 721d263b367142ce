//! Execution of notification batches off the event-loop thread.

use std::fmt;
use tracing::warn;

/// A unit of notification work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs notification batches. Implementations must not block the caller on
/// the job itself, except [`InlineDispatcher`] which exists for tests.
pub trait Dispatch: Send + Sync + fmt::Debug {
    fn dispatch(&self, job: Job);
}

/// One short-lived thread per batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDispatcher;

impl Dispatch for ThreadDispatcher {
    fn dispatch(&self, job: Job) {
        if let Err(e) = std::thread::Builder::new()
            .name("serial-event".to_string())
            .spawn(job)
        {
            warn!("Failed to spawn notification thread: {}", e);
        }
    }
}

/// Runs batches on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    handle: tokio::runtime::Handle,
}

impl TokioDispatcher {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling task.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Dispatch for TokioDispatcher {
    fn dispatch(&self, job: Job) {
        drop(self.handle.spawn_blocking(job));
    }
}

/// Runs each batch on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatch for InlineDispatcher {
    fn dispatch(&self, job: Job) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_thread_dispatcher_runs_job() {
        let (tx, rx) = mpsc::channel();
        ThreadDispatcher.dispatch(Box::new(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }

    #[test]
    fn test_tokio_dispatcher_runs_job() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        TokioDispatcher::new(runtime.handle().clone())
            .dispatch(Box::new(move || tx.send("done").unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "done");
    }
}
