//! In-flight read and write operations.
//!
//! An [`AsyncOperation`] is the caller's side of one transfer and a
//! [`CompletionHandle`] is the native layer's side. Completion may arrive
//! from the thread that submitted the transfer (the native call finished
//! synchronously) or from a completion callback. Both go through
//! [`CompletionHandle::complete`], where a compare-and-set on the
//! "completion called" marker lets exactly one of them record the outcome.

use super::context::ContextRef;
use super::pending::{PendingGuard, PendingOperations};
use crate::error::{Result, SerialError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// What an operation transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    WaitEvent,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::WaitEvent => "WaitEvent",
        })
    }
}

struct Outcome {
    bytes: usize,
    error: Option<SerialError>,
}

struct OperationState {
    kind: OperationKind,
    buffer: Mutex<Vec<u8>>,
    completion_called: AtomicBool,
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
    waiter_context: Mutex<Option<ContextRef>>,
    pending: Mutex<Option<PendingGuard>>,
}

impl OperationState {
    fn complete(&self, bytes: usize, error: Option<SerialError>) -> bool {
        if self
            .completion_called
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(kind = %self.kind, "late completion ignored");
            return false;
        }
        *self.outcome.lock() = Some(Outcome { bytes, error });
        self.done.notify_all();
        self.pending.lock().take();
        true
    }
}

/// The caller's side of a transfer.
///
/// Zero-length transfers are created with [`AsyncOperation::immediate`] and
/// never reach the native layer.
pub struct AsyncOperation {
    kind: OperationKind,
    requested: usize,
    end_called: AtomicBool,
    state: Option<Arc<OperationState>>,
}

impl AsyncOperation {
    /// Create an operation over `buffer`, registered with `pending` until it
    /// completes.
    pub fn new(kind: OperationKind, buffer: Vec<u8>, pending: &Arc<PendingOperations>) -> Self {
        let requested = buffer.len();
        let state = OperationState {
            kind,
            buffer: Mutex::new(buffer),
            completion_called: AtomicBool::new(false),
            outcome: Mutex::new(None),
            done: Condvar::new(),
            waiter_context: Mutex::new(None),
            pending: Mutex::new(Some(pending.begin())),
        };
        Self {
            kind,
            requested,
            end_called: AtomicBool::new(false),
            state: Some(Arc::new(state)),
        }
    }

    /// A zero-length operation that is already complete.
    pub fn immediate(kind: OperationKind) -> Self {
        Self {
            kind,
            requested: 0,
            end_called: AtomicBool::new(false),
            state: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Number of bytes the caller asked to transfer.
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn is_immediate(&self) -> bool {
        self.state.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.completion_called.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    /// Handle given to the native layer. `None` for immediate operations.
    pub fn completion_handle(&self) -> Option<CompletionHandle> {
        self.state.as_ref().map(|state| CompletionHandle {
            state: Arc::clone(state),
        })
    }

    /// Wait for completion and return the byte count.
    ///
    /// May be called once. A second call fails with
    /// [`SerialError::EndCalledTwice`], whatever the state of the transfer.
    /// With an infinite timeout, a completion that moved zero bytes without
    /// an error is reported as [`SerialError::OperationAborted`].
    pub fn end(&self, infinite_timeout: bool) -> Result<usize> {
        if self
            .end_called
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SerialError::EndCalledTwice(self.kind));
        }
        let Some(state) = &self.state else {
            return Ok(0);
        };

        let outcome = {
            let mut slot = state.outcome.lock();
            loop {
                if let Some(outcome) = slot.take() {
                    break outcome;
                }
                state.done.wait(&mut slot);
            }
        };

        if let Some(waiter) = state.waiter_context.lock().take() {
            waiter.release();
        }

        if let Some(error) = outcome.error {
            return Err(error);
        }
        if outcome.bytes == 0 && infinite_timeout && self.requested > 0 {
            return Err(SerialError::OperationAborted);
        }
        Ok(outcome.bytes)
    }

    /// Copy up to `dest.len()` transferred bytes out of the operation buffer.
    pub fn copy_into(&self, dest: &mut [u8], count: usize) -> usize {
        let Some(state) = &self.state else {
            return 0;
        };
        let buffer = state.buffer.lock();
        let n = count.min(dest.len()).min(buffer.len());
        dest[..n].copy_from_slice(&buffer[..n]);
        n
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("kind", &self.kind)
            .field("requested", &self.requested)
            .field("completed", &self.is_completed())
            .field("end_called", &self.end_called.load(Ordering::Acquire))
            .finish()
    }
}

/// The native layer's side of a transfer.
#[derive(Clone)]
pub struct CompletionHandle {
    state: Arc<OperationState>,
}

impl CompletionHandle {
    pub fn kind(&self) -> OperationKind {
        self.state.kind
    }

    pub fn len(&self) -> usize {
        self.state.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the outcome. Returns false if another path already completed
    /// the operation, in which case nothing changes.
    pub fn complete(&self, bytes: usize, error: Option<SerialError>) -> bool {
        self.state.complete(bytes, error)
    }

    pub fn is_completed(&self) -> bool {
        self.state.completion_called.load(Ordering::Acquire)
    }

    /// Hand the waiter's claim on the native context to the operation. It is
    /// released by `end`, or when the operation is dropped.
    pub fn attach_waiter_context(&self, waiter: ContextRef) {
        *self.state.waiter_context.lock() = Some(waiter);
    }

    /// Run `f` over the transfer buffer.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffer = self.state.buffer.lock();
        f(&mut buffer)
    }

    /// Stable pointer to the transfer buffer for native calls.
    ///
    /// The buffer is never resized, so the pointer stays valid as long as
    /// this handle or its operation is alive.
    pub fn buffer_ptr(&self) -> (*mut u8, usize) {
        let mut buffer = self.state.buffer.lock();
        (buffer.as_mut_ptr(), buffer.len())
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("kind", &self.state.kind)
            .field("completed", &self.is_completed())
            .finish()
    }
}
