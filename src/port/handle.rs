//! Ownership of the native device handle.
//!
//! A [`PortHandle`] is `Invalid` until a platform open attaches a handle, and
//! returns to `Invalid` when released. A native call that reports the handle
//! as stale or the device as removed moves it to `Invalidated`. From then on
//! every access short-circuits with [`SerialError::NotOpen`] and the native
//! handle is never passed to the OS again, apart from the final close.
//!
//! All transitions happen under one lock, so a release from the drop path
//! and an explicit close cannot both close the handle.

use crate::error::{Result, SerialError};
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

/// A raw OS handle that knows how to close itself.
pub trait NativeHandle: Copy + Send + Sync + fmt::Debug + 'static {
    fn close(self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState<H> {
    Invalid,
    Valid(H),
    /// `Some` when the handle still belongs to us and must be closed on
    /// release; `None` when the OS reported it as stale.
    Invalidated(Option<H>),
}

pub struct PortHandle<H: NativeHandle> {
    state: Mutex<HandleState<H>>,
}

impl<H: NativeHandle> Default for PortHandle<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: NativeHandle> PortHandle<H> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandleState::Invalid),
        }
    }

    /// Take ownership of a freshly opened handle.
    pub fn attach(&self, handle: H) -> Result<()> {
        let mut state = self.state.lock();
        if let HandleState::Valid(_) = *state {
            return Err(SerialError::AlreadyOpen);
        }
        *state = HandleState::Valid(handle);
        Ok(())
    }

    pub fn get(&self) -> Result<H> {
        match *self.state.lock() {
            HandleState::Valid(h) => Ok(h),
            HandleState::Invalid | HandleState::Invalidated(_) => Err(SerialError::NotOpen),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Valid(_))
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(*self.state.lock(), HandleState::Invalidated(_))
    }

    /// Run a native call against the handle. Device-loss errors invalidate it.
    pub fn with<T>(&self, f: impl FnOnce(H) -> Result<T>) -> Result<T> {
        let handle = self.get()?;
        let result = f(handle);
        if let Err(ref e) = result {
            self.observe(e);
        }
        result
    }

    /// Invalidate the handle if `error` means it can no longer be used.
    pub fn observe(&self, error: &SerialError) {
        match error {
            SerialError::HandleInvalidated => self.invalidate(true),
            SerialError::DeviceRemoved => self.invalidate(false),
            _ => {}
        }
    }

    /// Stop using the handle. `stale` handles are not closed on release.
    pub fn invalidate(&self, stale: bool) {
        let mut state = self.state.lock();
        if let HandleState::Valid(h) = *state {
            debug!(?h, stale, "Port handle invalidated");
            *state = HandleState::Invalidated(if stale { None } else { Some(h) });
        }
    }

    /// Close the handle if we still own one. Idempotent; returns true when a
    /// native close happened.
    pub fn release(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let owned = match std::mem::replace(&mut *state, HandleState::Invalid) {
            HandleState::Valid(h) | HandleState::Invalidated(Some(h)) => h,
            HandleState::Invalid | HandleState::Invalidated(None) => return Ok(false),
        };
        owned.close()?;
        Ok(true)
    }
}

impl<H: NativeHandle> fmt::Debug for PortHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortHandle").field(&*self.state.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CLOSES: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FakeHandle(u32);

    impl NativeHandle for FakeHandle {
        fn close(self) -> Result<()> {
            CLOSES.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_lifecycle() {
        let handle = PortHandle::new();
        assert!(matches!(handle.get(), Err(SerialError::NotOpen)));

        handle.attach(FakeHandle(3)).unwrap();
        assert_eq!(handle.get().unwrap(), FakeHandle(3));
        assert!(matches!(
            handle.attach(FakeHandle(4)),
            Err(SerialError::AlreadyOpen)
        ));

        let before = CLOSES.load(Ordering::SeqCst);
        assert!(handle.release().unwrap());
        assert!(!handle.release().unwrap());
        assert_eq!(CLOSES.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_stale_handle_short_circuits() {
        let handle = PortHandle::new();
        handle.attach(FakeHandle(5)).unwrap();

        let calls = AtomicUsize::new(0);
        let result: Result<()> = handle.with(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SerialError::HandleInvalidated)
        });
        assert!(matches!(result, Err(SerialError::HandleInvalidated)));
        assert!(handle.is_invalidated());

        let result: Result<()> = handle.with(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(result, Err(SerialError::NotOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // stale handles are forgotten rather than closed
        assert!(!handle.release().unwrap());
    }

    #[test]
    fn test_removed_device_handle_is_still_closed() {
        let handle = PortHandle::new();
        handle.attach(FakeHandle(6)).unwrap();
        handle.observe(&SerialError::DeviceRemoved);
        assert!(handle.release().unwrap());
    }
}
