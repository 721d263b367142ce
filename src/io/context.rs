//! Reference-counted ownership of per-operation native resources.
//!
//! A native resource (an `OVERLAPPED` block, for example) is shared by two
//! parties: the thread waiting for the result and the completion callback.
//! [`NativeContext::allocate`] hands each party a move-only [`ContextRef`].
//! Releasing a ref decrements an atomic count and the ref that takes it to
//! zero runs the free routine. Since refs cannot be cloned, a party cannot
//! release twice.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type FreeFn = Box<dyn FnOnce() + Send>;

struct Shared {
    refs: AtomicUsize,
    free: Mutex<Option<FreeFn>>,
}

impl Shared {
    /// Returns true when this call freed the resource.
    fn release_one(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        if let Some(free) = self.free.lock().take() {
            free();
        }
        true
    }
}

/// Factory for shared native contexts.
pub struct NativeContext;

impl NativeContext {
    /// Create a context whose `free` routine runs once both refs are released.
    pub fn allocate<F>(free: F) -> (ContextRef, ContextRef)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            refs: AtomicUsize::new(2),
            free: Mutex::new(Some(Box::new(free))),
        });
        (
            ContextRef {
                shared: Some(Arc::clone(&shared)),
            },
            ContextRef {
                shared: Some(shared),
            },
        )
    }
}

/// One party's claim on a native context.
///
/// Dropping an unreleased ref releases it.
pub struct ContextRef {
    shared: Option<Arc<Shared>>,
}

impl ContextRef {
    /// Give up this claim. Returns true if the resource was freed by this call.
    pub fn release(mut self) -> bool {
        self.shared
            .take()
            .map(|shared| shared.release_one())
            .unwrap_or(false)
    }

    /// Number of claims still outstanding, this one included.
    pub fn outstanding(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release_one();
        }
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
